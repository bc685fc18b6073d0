//! Record types: the transient plaintext view and the persisted sealed form.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

pub const SCHEMA_VERSION: u16 = 1;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Ids are stored hex-encoded in file names, so keep them under the common
/// 255-byte file name limit.
pub const MAX_RECORD_ID_LEN: usize = 120;

pub fn validate_record_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(VaultError::InvalidRecordId("id is empty".into()));
    }
    if id.len() > MAX_RECORD_ID_LEN {
        return Err(VaultError::InvalidRecordId(format!(
            "id is {} bytes, limit is {MAX_RECORD_ID_LEN}",
            id.len()
        )));
    }
    if id.contains('\0') {
        return Err(VaultError::InvalidRecordId("id contains NUL".into()));
    }
    Ok(())
}

/// Decrypted application data. Lives in memory only: it has no `Serialize`
/// impl, its `Debug` output is redacted and its bytes are wiped on drop.
pub struct PlaintextRecord(Zeroizing<Vec<u8>>);

impl PlaintextRecord {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for PlaintextRecord {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&str> for PlaintextRecord {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

impl PartialEq for PlaintextRecord {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for PlaintextRecord {}

impl fmt::Debug for PlaintextRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaintextRecord")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// The persisted unit. Contains nothing but ciphertext and the public
/// parameters needed to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub id: String,
    pub schema_version: u16,
    pub key_id: Uuid,
    pub key_generation: u32,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

impl EncryptedRecord {
    /// Associated data bound into the tag: a record cannot be replayed under
    /// another id, schema or key without failing verification.
    pub(crate) fn associated_data(id: &str, schema_version: u16, key_id: &Uuid) -> Vec<u8> {
        let mut aad = Vec::with_capacity(16 + 2 + 16 + id.len());
        aad.extend_from_slice(b"vault-record-v1\0");
        aad.extend_from_slice(&schema_version.to_be_bytes());
        aad.extend_from_slice(key_id.as_bytes());
        aad.extend_from_slice(id.as_bytes());
        aad
    }
}

mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
