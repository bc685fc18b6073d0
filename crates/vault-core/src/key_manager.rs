//! Master key lifecycle: first-use provisioning, session key derivation,
//! invalidation tracking and explicit re-provisioning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::keystore::{AuthProof, KeyAlgorithm, KeyPolicy, KeystoreError, SecureKeystore};
use crate::store::VaultStore;

/// HKDF info for the record encryption key. Deterministic per master key so
/// that records written in one session open in the next.
pub const RECORD_KEY_INFO: &[u8] = b"meruscrap-vault/record-key/v1";
/// NIST SP 800-38D bound for random 96-bit GCM nonces under one key.
pub const MAX_ENCRYPTIONS_PER_KEY: u64 = 1 << 32;

/// Persisted pointer to the current master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReference {
    pub alias: String,
    pub key_id: Uuid,
    pub generation: u32,
    pub algorithm: KeyAlgorithm,
    pub created_at: DateTime<Utc>,
    pub invalidated: bool,
    #[serde(default)]
    pub invalidated_at: Option<DateTime<Utc>>,
}

impl KeyReference {
    fn keystore_alias(&self) -> String {
        keystore_alias(&self.alias, self.generation)
    }
}

fn keystore_alias(alias: &str, generation: u32) -> String {
    format!("{alias}.g{generation}")
}

/// Handle to the master key inside the keystore. Carries no key material
/// and cannot be cloned.
#[derive(Debug)]
pub struct MasterKey {
    key_id: Uuid,
    alias: String,
    generation: u32,
    algorithm: KeyAlgorithm,
    created_at: DateTime<Utc>,
}

impl MasterKey {
    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn keystore_alias(&self) -> String {
        keystore_alias(&self.alias, self.generation)
    }
}

impl From<&KeyReference> for MasterKey {
    fn from(reference: &KeyReference) -> Self {
        Self {
            key_id: reference.key_id,
            alias: reference.alias.clone(),
            generation: reference.generation,
            algorithm: reference.algorithm,
            created_at: reference.created_at,
        }
    }
}

/// Record encryption key for one unlocked session. Wiped on drop.
pub struct SessionKey {
    material: Zeroizing<[u8; 32]>,
    key_id: Uuid,
    generation: u32,
    encryptions: AtomicU64,
}

impl SessionKey {
    pub(crate) fn new(material: Zeroizing<[u8; 32]>, key_id: Uuid, generation: u32) -> Self {
        Self {
            material,
            key_id,
            generation,
            encryptions: AtomicU64::new(0),
        }
    }

    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn encryptions(&self) -> u64 {
        self.encryptions.load(Ordering::Relaxed)
    }

    pub(crate) fn material(&self) -> &[u8; 32] {
        &self.material
    }

    /// Account for one more encryption, refusing once the nonce budget is spent.
    pub(crate) fn reserve_encryption(&self) -> Result<()> {
        let used = self.encryptions.fetch_add(1, Ordering::Relaxed);
        if used >= MAX_ENCRYPTIONS_PER_KEY {
            warn!(key_id = %self.key_id, "session key exhausted its encryption budget");
            return Err(VaultError::InvalidSessionKey);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_encryptions(&self, count: u64) {
        self.encryptions.store(count, Ordering::Relaxed);
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("key_id", &self.key_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

pub struct KeyManager {
    keystore: Arc<dyn SecureKeystore>,
    store: Arc<dyn VaultStore>,
    alias: String,
}

impl KeyManager {
    pub fn new(
        keystore: Arc<dyn SecureKeystore>,
        store: Arc<dyn VaultStore>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            keystore,
            store,
            alias: alias.into(),
        }
    }

    /// Keys accept either authentication class. Whether the device
    /// credential is offered is a setting enforced by the auth gate, so
    /// toggling it never strands an existing key.
    fn policy(&self) -> KeyPolicy {
        KeyPolicy {
            require_auth_per_use: true,
            invalidate_on_enrollment_change: true,
            allow_device_credential: true,
        }
    }

    pub fn key_reference(&self) -> Result<Option<KeyReference>> {
        self.store.load_key_reference()
    }

    /// Return the current master key, creating it on first use.
    pub fn ensure_key(&self) -> Result<MasterKey> {
        let Some(reference) = self.store.load_key_reference()? else {
            if !self.store.list()?.is_empty() {
                return Err(VaultError::KeyUnavailable(
                    "key reference missing while encrypted records exist".into(),
                ));
            }
            return self.provision(1);
        };
        if reference.invalidated {
            return Err(VaultError::ReprovisionRequired);
        }
        match self.keystore.attributes(&reference.keystore_alias()) {
            Ok(Some(attributes)) if attributes.key_id == reference.key_id => {
                Ok(MasterKey::from(&reference))
            }
            Ok(Some(_)) => Err(VaultError::KeyUnavailable(
                "keystore key does not match the key reference".into(),
            )),
            Ok(None) => Err(VaultError::KeyUnavailable(format!(
                "master key {} missing from keystore",
                reference.key_id
            ))),
            Err(KeystoreError::Invalidated) => {
                self.mark_invalidated(reference)?;
                Err(VaultError::KeyInvalidated)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unseal the record key. Consumes the proof.
    pub fn derive_session_key(&self, master: &MasterKey, proof: AuthProof) -> Result<SessionKey> {
        match self
            .keystore
            .derive(&master.keystore_alias(), proof, RECORD_KEY_INFO)
        {
            Ok(material) => Ok(SessionKey::new(material, master.key_id, master.generation)),
            Err(KeystoreError::Invalidated) => {
                if let Some(reference) = self.store.load_key_reference()? {
                    if reference.key_id == master.key_id {
                        self.mark_invalidated(reference)?;
                    }
                }
                Err(VaultError::KeyInvalidated)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace an invalidated or missing master key with a fresh one.
    ///
    /// Records sealed under the old key stay on disk and are reported as
    /// unreadable; nothing here pretends to recover them.
    pub fn reprovision(&self) -> Result<MasterKey> {
        let next_generation = match self.store.load_key_reference()? {
            None => 1,
            Some(reference) => {
                let healthy = !reference.invalidated
                    && matches!(
                        self.keystore.attributes(&reference.keystore_alias()),
                        Ok(Some(ref attrs)) if attrs.key_id == reference.key_id
                    );
                if healthy {
                    return Err(VaultError::KeyHealthy);
                }
                match self.keystore.delete(&reference.keystore_alias()) {
                    Ok(()) | Err(KeystoreError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                reference.generation + 1
            }
        };
        let master = self.provision(next_generation)?;
        info!(
            key_id = %master.key_id,
            generation = master.generation,
            "master key re-provisioned"
        );
        Ok(master)
    }

    fn provision(&self, generation: u32) -> Result<MasterKey> {
        let alias = keystore_alias(&self.alias, generation);
        let attributes = self.keystore.generate(&alias, self.policy())?;
        let reference = KeyReference {
            alias: self.alias.clone(),
            key_id: attributes.key_id,
            generation,
            algorithm: attributes.algorithm,
            created_at: attributes.created_at,
            invalidated: false,
            invalidated_at: None,
        };
        self.store.save_key_reference(&reference)?;
        info!(key_id = %reference.key_id, generation, "master key provisioned");
        Ok(MasterKey::from(&reference))
    }

    fn mark_invalidated(&self, mut reference: KeyReference) -> Result<()> {
        if reference.invalidated {
            return Ok(());
        }
        warn!(
            key_id = %reference.key_id,
            generation = reference.generation,
            "master key invalidated; existing records are unreadable until re-provisioning"
        );
        reference.invalidated = true;
        reference.invalidated_at = Some(Utc::now());
        self.store.save_key_reference(&reference)
    }
}
