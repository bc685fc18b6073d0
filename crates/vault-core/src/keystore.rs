//! Platform secure keystore seam.
//!
//! A keystore holds master key material and never hands it out. The only
//! thing that leaves it is a key *derived* from the master key after the
//! caller presents a fresh [`AuthProof`]; that derived key is what the
//! record codec works with.
//!
//! - [`SoftwareKeystore`] keeps keys in process memory. It models biometric
//!   enrollment so that invalidation can be exercised in tests.
//! - `KeyringKeystore` (see `secure_storage`) keeps keys in the OS
//!   credential store.

use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::VaultError;

/// How long a completed authentication may be used to unseal a key.
pub const AUTH_VALIDITY: Duration = Duration::from_secs(10);
pub const MASTER_KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeystoreError {
    #[error("no key under alias {0}")]
    NotFound(String),
    #[error("key permanently invalidated")]
    Invalidated,
    #[error("user authentication required")]
    AuthRequired,
    #[error("keystore unavailable: {0}")]
    Unavailable(String),
}

impl From<KeystoreError> for VaultError {
    fn from(err: KeystoreError) -> Self {
        match err {
            KeystoreError::NotFound(alias) => {
                VaultError::KeyUnavailable(format!("no key under alias {alias}"))
            }
            KeystoreError::Invalidated => VaultError::KeyInvalidated,
            KeystoreError::AuthRequired => VaultError::AuthenticationRequired,
            KeystoreError::Unavailable(msg) => VaultError::KeyUnavailable(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMethod {
    Biometric,
    DeviceCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAlgorithm {
    Aes256Gcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub require_auth_per_use: bool,
    pub invalidate_on_enrollment_change: bool,
    pub allow_device_credential: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttributes {
    pub key_id: Uuid,
    pub alias: String,
    pub algorithm: KeyAlgorithm,
    pub created_at: DateTime<Utc>,
    pub policy: KeyPolicy,
}

/// Evidence that the user just passed an authentication ceremony.
///
/// Not `Clone`: unsealing a key consumes the proof, so one ceremony
/// authorises one key use.
#[derive(Debug)]
pub struct AuthProof {
    method: AuthMethod,
    issued_at: Instant,
}

impl AuthProof {
    pub fn new(method: AuthMethod) -> Self {
        Self {
            method,
            issued_at: Instant::now(),
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub fn is_fresh(&self, window: Duration) -> bool {
        self.issued_at.elapsed() <= window
    }
}

pub trait SecureKeystore: Send + Sync {
    /// Attributes of the key under `alias`, or `None` if there is no such key.
    /// Fails with [`KeystoreError::Invalidated`] once the key can no longer be used.
    fn attributes(&self, alias: &str) -> Result<Option<KeyAttributes>, KeystoreError>;

    /// Create a new key under `alias`, replacing nothing: fails if one exists.
    fn generate(&self, alias: &str, policy: KeyPolicy) -> Result<KeyAttributes, KeystoreError>;

    /// Derive a 256-bit subkey bound to `info` from the key under `alias`.
    fn derive(
        &self,
        alias: &str,
        proof: AuthProof,
        info: &[u8],
    ) -> Result<Zeroizing<[u8; 32]>, KeystoreError>;

    fn delete(&self, alias: &str) -> Result<(), KeystoreError>;
}

/// HKDF-SHA256 with the key id as salt, shared by keystore implementations.
pub(crate) fn derive_subkey(
    material: &[u8],
    key_id: &Uuid,
    info: &[u8],
) -> Result<Zeroizing<[u8; 32]>, KeystoreError> {
    let hk = Hkdf::<Sha256>::new(Some(key_id.as_bytes()), material);
    let mut out = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut out[..])
        .map_err(|e| KeystoreError::Unavailable(format!("hkdf expand: {e}")))?;
    Ok(out)
}

/// Checks every keystore applies before unsealing.
pub(crate) fn check_proof(policy: &KeyPolicy, proof: &AuthProof) -> Result<(), KeystoreError> {
    if policy.require_auth_per_use && !proof.is_fresh(AUTH_VALIDITY) {
        return Err(KeystoreError::AuthRequired);
    }
    if proof.method() == AuthMethod::DeviceCredential && !policy.allow_device_credential {
        return Err(KeystoreError::AuthRequired);
    }
    Ok(())
}

pub(crate) fn random_key_material() -> Zeroizing<[u8; MASTER_KEY_LEN]> {
    let mut material = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut material[..]);
    material
}

struct SoftKey {
    attributes: KeyAttributes,
    material: Zeroizing<[u8; MASTER_KEY_LEN]>,
    enrollment_epoch: u64,
    invalidated: bool,
}

#[derive(Default)]
struct SoftState {
    keys: HashMap<String, SoftKey>,
    enrollment_epoch: u64,
    unavailable: Option<String>,
}

/// In-process keystore with simulated biometric enrollment.
#[derive(Default)]
pub struct SoftwareKeystore {
    state: Mutex<SoftState>,
}

impl SoftwareKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the user enrolling a new fingerprint or face: every key bound
    /// to the previous enrollment set becomes permanently unusable.
    pub fn change_enrollment(&self) {
        let mut state = self.state.lock();
        state.enrollment_epoch += 1;
        tracing::debug!(epoch = state.enrollment_epoch, "biometric enrollment changed");
    }

    /// Simulate the keystore service going away (`None` restores it).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state.lock().unavailable = reason.map(str::to_string);
    }

    pub fn key_count(&self) -> usize {
        self.state.lock().keys.len()
    }

    fn refresh_validity(key: &mut SoftKey, epoch: u64) {
        if key.attributes.policy.invalidate_on_enrollment_change && key.enrollment_epoch != epoch {
            key.invalidated = true;
        }
    }
}

impl SecureKeystore for SoftwareKeystore {
    fn attributes(&self, alias: &str) -> Result<Option<KeyAttributes>, KeystoreError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.unavailable {
            return Err(KeystoreError::Unavailable(reason.clone()));
        }
        let epoch = state.enrollment_epoch;
        match state.keys.get_mut(alias) {
            None => Ok(None),
            Some(key) => {
                Self::refresh_validity(key, epoch);
                if key.invalidated {
                    return Err(KeystoreError::Invalidated);
                }
                Ok(Some(key.attributes.clone()))
            }
        }
    }

    fn generate(&self, alias: &str, policy: KeyPolicy) -> Result<KeyAttributes, KeystoreError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.unavailable {
            return Err(KeystoreError::Unavailable(reason.clone()));
        }
        if state.keys.contains_key(alias) {
            return Err(KeystoreError::Unavailable(format!("alias {alias} already in use")));
        }
        let attributes = KeyAttributes {
            key_id: Uuid::new_v4(),
            alias: alias.to_string(),
            algorithm: KeyAlgorithm::Aes256Gcm,
            created_at: Utc::now(),
            policy,
        };
        let epoch = state.enrollment_epoch;
        state.keys.insert(
            alias.to_string(),
            SoftKey {
                attributes: attributes.clone(),
                material: random_key_material(),
                enrollment_epoch: epoch,
                invalidated: false,
            },
        );
        Ok(attributes)
    }

    fn derive(
        &self,
        alias: &str,
        proof: AuthProof,
        info: &[u8],
    ) -> Result<Zeroizing<[u8; 32]>, KeystoreError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.unavailable {
            return Err(KeystoreError::Unavailable(reason.clone()));
        }
        let epoch = state.enrollment_epoch;
        let key = state
            .keys
            .get_mut(alias)
            .ok_or_else(|| KeystoreError::NotFound(alias.to_string()))?;
        Self::refresh_validity(key, epoch);
        if key.invalidated {
            return Err(KeystoreError::Invalidated);
        }
        check_proof(&key.attributes.policy, &proof)?;
        derive_subkey(&key.material[..], &key.attributes.key_id, info)
    }

    fn delete(&self, alias: &str) -> Result<(), KeystoreError> {
        let mut state = self.state.lock();
        state
            .keys
            .remove(alias)
            .map(|_| ())
            .ok_or_else(|| KeystoreError::NotFound(alias.to_string()))
    }
}
