//! Keystore backed by the OS credential store (Secret Service, Keychain,
//! Windows Credential Manager) through the `keyring` crate.
//!
//! Key material is written once at generation and only ever read back inside
//! [`KeyringKeystore::derive`]. The key is bound to an enrollment stamp
//! supplied by the host (for the CLI, a digest of the device PIN hash):
//! when the stamp changes the key is marked invalidated and stays that way.

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use keyring::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::keystore::{
    check_proof, derive_subkey, random_key_material, AuthProof, KeyAlgorithm, KeyAttributes,
    KeyPolicy, KeystoreError, SecureKeystore,
};

pub const SERVICE_NAME: &str = "MeruScrapVault";
const MASTER_KEY_PREFIX: &str = "master_key";

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredKey {
    #[zeroize(skip)]
    attributes: KeyAttributes,
    material: String,
    #[zeroize(skip)]
    enrollment_stamp: String,
    #[zeroize(skip)]
    invalidated: bool,
}

/// Credential entries are opened once per alias and reused.
pub struct KeyringKeystore {
    service: String,
    enrollment_stamp: String,
    entries: Arc<Mutex<HashMap<String, Arc<Entry>>>>,
}

impl KeyringKeystore {
    pub fn new(enrollment_stamp: impl Into<String>) -> Self {
        Self::with_service(SERVICE_NAME, enrollment_stamp)
    }

    pub fn with_service(service: &str, enrollment_stamp: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            enrollment_stamp: enrollment_stamp.into(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Same credential entries seen under a different enrollment.
    #[cfg(test)]
    fn rebound(&self, enrollment_stamp: &str) -> Self {
        Self {
            service: self.service.clone(),
            enrollment_stamp: enrollment_stamp.to_string(),
            entries: self.entries.clone(),
        }
    }

    fn entry(&self, alias: &str) -> Result<Arc<Entry>, KeystoreError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(alias) {
            return Ok(entry.clone());
        }
        let entry = Entry::new(&self.service, &format!("{MASTER_KEY_PREFIX}:{alias}"))
            .map_err(|e| KeystoreError::Unavailable(format!("keyring init: {e}")))?;
        let entry = Arc::new(entry);
        entries.insert(alias.to_string(), entry.clone());
        Ok(entry)
    }

    fn load(&self, alias: &str) -> Result<Option<StoredKey>, KeystoreError> {
        let entry = self.entry(alias)?;
        let json = match entry.get_password() {
            Ok(json) => Zeroizing::new(json),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(KeystoreError::Unavailable(format!("load key: {e}"))),
        };
        let stored: StoredKey = serde_json::from_str(&json)
            .map_err(|e| KeystoreError::Unavailable(format!("parse stored key: {e}")))?;
        Ok(Some(stored))
    }

    fn save(&self, alias: &str, stored: &StoredKey) -> Result<(), KeystoreError> {
        let json = Zeroizing::new(
            serde_json::to_string(stored)
                .map_err(|e| KeystoreError::Unavailable(format!("encode stored key: {e}")))?,
        );
        self.entry(alias)?
            .set_password(&json)
            .map_err(|e| KeystoreError::Unavailable(format!("store key: {e}")))
    }

    /// Loads the key and applies the enrollment binding. A stamp mismatch is
    /// persisted so the key stays invalid even if the stamp changes back.
    fn load_valid(&self, alias: &str) -> Result<Option<StoredKey>, KeystoreError> {
        let Some(mut stored) = self.load(alias)? else {
            return Ok(None);
        };
        if !stored.invalidated
            && stored.attributes.policy.invalidate_on_enrollment_change
            && stored.enrollment_stamp != self.enrollment_stamp
        {
            stored.invalidated = true;
            self.save(alias, &stored)?;
            tracing::warn!(alias, "keyring key invalidated by enrollment change");
        }
        if stored.invalidated {
            return Err(KeystoreError::Invalidated);
        }
        Ok(Some(stored))
    }
}

impl SecureKeystore for KeyringKeystore {
    fn attributes(&self, alias: &str) -> Result<Option<KeyAttributes>, KeystoreError> {
        Ok(self
            .load_valid(alias)?
            .map(|stored| stored.attributes.clone()))
    }

    fn generate(&self, alias: &str, policy: KeyPolicy) -> Result<KeyAttributes, KeystoreError> {
        if self.load(alias)?.is_some() {
            return Err(KeystoreError::Unavailable(format!("alias {alias} already in use")));
        }
        let material = random_key_material();
        let attributes = KeyAttributes {
            key_id: Uuid::new_v4(),
            alias: alias.to_string(),
            algorithm: KeyAlgorithm::Aes256Gcm,
            created_at: Utc::now(),
            policy,
        };
        let stored = StoredKey {
            attributes: attributes.clone(),
            material: general_purpose::STANDARD.encode(&material[..]),
            enrollment_stamp: self.enrollment_stamp.clone(),
            invalidated: false,
        };
        self.save(alias, &stored)?;
        Ok(attributes)
    }

    fn derive(
        &self,
        alias: &str,
        proof: AuthProof,
        info: &[u8],
    ) -> Result<Zeroizing<[u8; 32]>, KeystoreError> {
        let stored = self
            .load_valid(alias)?
            .ok_or_else(|| KeystoreError::NotFound(alias.to_string()))?;
        check_proof(&stored.attributes.policy, &proof)?;
        let material = Zeroizing::new(
            general_purpose::STANDARD
                .decode(&stored.material)
                .map_err(|e| KeystoreError::Unavailable(format!("decode stored key: {e}")))?,
        );
        derive_subkey(&material, &stored.attributes.key_id, info)
    }

    fn delete(&self, alias: &str) -> Result<(), KeystoreError> {
        match self.entry(alias)?.delete_password() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Err(KeystoreError::NotFound(alias.to_string())),
            Err(e) => Err(KeystoreError::Unavailable(format!("delete key: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::AuthMethod;

    fn keystore(stamp: &str) -> KeyringKeystore {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        KeyringKeystore::with_service("vault-core-test", stamp)
    }

    fn policy() -> KeyPolicy {
        KeyPolicy {
            require_auth_per_use: true,
            invalidate_on_enrollment_change: true,
            allow_device_credential: true,
        }
    }

    #[tokio::test]
    async fn generate_then_derive() {
        let ks = keystore("pin-a");
        let attributes = ks.generate("k", policy()).unwrap();
        assert_eq!(ks.attributes("k").unwrap().unwrap().key_id, attributes.key_id);

        let a = ks
            .derive("k", AuthProof::new(AuthMethod::Biometric), b"records")
            .unwrap();
        let b = ks
            .derive("k", AuthProof::new(AuthMethod::DeviceCredential), b"records")
            .unwrap();
        assert_eq!(*a, *b);
        assert!(ks.attributes("missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn alias_is_not_generated_twice() {
        let ks = keystore("pin-a");
        ks.generate("k", policy()).unwrap();
        assert!(matches!(
            ks.generate("k", policy()),
            Err(KeystoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn enrollment_change_invalidates_for_good() {
        let ks = keystore("pin-a");
        ks.generate("k", policy()).unwrap();

        let changed = ks.rebound("pin-b");
        assert!(matches!(changed.attributes("k"), Err(KeystoreError::Invalidated)));
        assert!(matches!(
            changed.derive("k", AuthProof::new(AuthMethod::Biometric), b"records"),
            Err(KeystoreError::Invalidated)
        ));

        // restoring the old stamp does not revive the key
        assert!(matches!(ks.attributes("k"), Err(KeystoreError::Invalidated)));
        assert!(matches!(
            ks.derive("k", AuthProof::new(AuthMethod::Biometric), b"records"),
            Err(KeystoreError::Invalidated)
        ));
    }

    #[tokio::test]
    async fn delete_removes_the_key() {
        let ks = keystore("pin-a");
        ks.generate("k", policy()).unwrap();
        ks.delete("k").unwrap();
        assert!(ks.attributes("k").unwrap().is_none());
        assert!(matches!(ks.delete("k"), Err(KeystoreError::NotFound(_))));
    }
}
