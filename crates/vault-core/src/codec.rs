//! Authenticated encryption of record payloads.
//!
//! AES-256-GCM, 96-bit random nonce per call, 128-bit tag stored detached.
//! Tag verification completes before any plaintext is handed back.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{Result, UnreadableReason, VaultError};
use crate::key_manager::SessionKey;
use crate::record::{EncryptedRecord, PlaintextRecord, NONCE_LEN, SCHEMA_VERSION, TAG_LEN};

const TEXT_AAD_PREFIX: &[u8] = b"vault-text-v1\0";

pub struct CipherCodec;

impl CipherCodec {
    pub fn encrypt(key: &SessionKey, id: &str, plaintext: &PlaintextRecord) -> Result<EncryptedRecord> {
        key.reserve_encryption()?;
        let cipher = cipher_for(key)?;
        let nonce = fresh_nonce();
        let aad = EncryptedRecord::associated_data(id, SCHEMA_VERSION, &key.key_id());
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &aad, &mut buffer)
            .map_err(|_| VaultError::InvalidSessionKey)?;
        Ok(EncryptedRecord {
            id: id.to_string(),
            schema_version: SCHEMA_VERSION,
            key_id: key.key_id(),
            key_generation: key.generation(),
            nonce: nonce.to_vec(),
            ciphertext: buffer,
            tag: tag.to_vec(),
        })
    }

    pub fn decrypt(key: &SessionKey, record: &EncryptedRecord) -> Result<PlaintextRecord> {
        if record.schema_version != SCHEMA_VERSION {
            return Err(VaultError::RecordUnreadable {
                id: record.id.clone(),
                reason: UnreadableReason::UnsupportedSchema,
            });
        }
        if record.key_id != key.key_id() {
            if record.key_generation < key.generation() {
                return Err(VaultError::RecordUnreadable {
                    id: record.id.clone(),
                    reason: UnreadableReason::KeyRetired,
                });
            }
            // key_id is authenticated, so any other mismatch is tampering
            return Err(VaultError::IntegrityCheckFailed {
                id: record.id.clone(),
            });
        }
        if record.nonce.len() != NONCE_LEN || record.tag.len() != TAG_LEN {
            return Err(VaultError::IntegrityCheckFailed {
                id: record.id.clone(),
            });
        }
        let cipher = cipher_for(key)?;
        let aad = EncryptedRecord::associated_data(&record.id, record.schema_version, &record.key_id);
        let mut buffer = Zeroizing::new(record.ciphertext.clone());
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&record.nonce),
                &aad,
                &mut buffer,
                GenericArray::from_slice(&record.tag),
            )
            .map_err(|_| VaultError::IntegrityCheckFailed {
                id: record.id.clone(),
            })?;
        Ok(PlaintextRecord::new(std::mem::take(&mut *buffer)))
    }

    /// Seal one string into `base64(nonce || ciphertext || tag)`. `context`
    /// is authenticated, so a value sealed for one setting cannot be
    /// presented as another.
    pub fn seal_text(key: &SessionKey, context: &str, text: &str) -> Result<String> {
        key.reserve_encryption()?;
        let cipher = cipher_for(key)?;
        let nonce = fresh_nonce();
        let aad = text_aad(context);
        let mut buffer = text.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &aad, &mut buffer)
            .map_err(|_| VaultError::InvalidSessionKey)?;
        let mut out = Vec::with_capacity(NONCE_LEN + buffer.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&buffer);
        out.extend_from_slice(&tag);
        Ok(general_purpose::STANDARD.encode(out))
    }

    pub fn open_text(key: &SessionKey, context: &str, sealed: &str) -> Result<Zeroizing<String>> {
        let integrity = || VaultError::IntegrityCheckFailed {
            id: context.to_string(),
        };
        let data = general_purpose::STANDARD
            .decode(sealed.trim())
            .map_err(|_| integrity())?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(integrity());
        }
        let (nonce, rest) = data.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let cipher = cipher_for(key)?;
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &text_aad(context),
                &mut buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| integrity())?;
        let text = String::from_utf8(std::mem::take(&mut *buffer)).map_err(|_| integrity())?;
        Ok(Zeroizing::new(text))
    }
}

fn cipher_for(key: &SessionKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.material()).map_err(|_| VaultError::InvalidSessionKey)
}

fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn text_aad(context: &str) -> Vec<u8> {
    let mut aad = TEXT_AAD_PREFIX.to_vec();
    aad.extend_from_slice(context.as_bytes());
    aad
}
