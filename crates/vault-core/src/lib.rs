//! Biometric-gated encrypted local record vault.
//!
//! Records are sealed with AES-256-GCM under a key derived from a master key
//! that never leaves the platform keystore, and can only be opened while a
//! [`SessionController`] holds a fresh unlock.

pub mod audit;
pub mod auth;
pub mod codec;
pub mod error;
pub mod key_manager;
pub mod keystore;
pub mod paths;
pub mod record;
pub mod secure_storage;
pub mod session;
pub mod settings;
pub mod store;
pub mod testing;

pub use audit::{AuditEntry, AuditLog, AuditSeverity, ChainReport};
pub use auth::{
    AuthGate, Authenticator, CancelSignal, Challenge, PromptOutcome, PromptReply, UnlockToken,
};
pub use codec::CipherCodec;
pub use error::{Result, UnreadableReason, VaultError};
pub use key_manager::{KeyManager, KeyReference, MasterKey, SessionKey};
pub use keystore::{AuthMethod, AuthProof, KeyAlgorithm, KeyPolicy, SecureKeystore, SoftwareKeystore};
pub use record::{EncryptedRecord, PlaintextRecord};
pub use secure_storage::KeyringKeystore;
pub use session::{SessionController, SessionState, VaultStatus};
pub use settings::VaultSettings;
pub use store::{FileVaultStore, MemoryVaultStore, VaultStore};
