use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a stored record can no longer be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnreadableReason {
    /// Sealed under a master key that has since been invalidated and replaced.
    KeyRetired,
    /// Written by a newer (or unknown) record format.
    UnsupportedSchema,
}

impl fmt::Display for UnreadableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnreadableReason::KeyRetired => f.write_str("sealed under a retired master key"),
            UnreadableReason::UnsupportedSchema => f.write_str("unsupported record schema"),
        }
    }
}

/// Every failure the vault can report.
///
/// `Clone` so that the outcome of a single unlock attempt can be handed to
/// every caller that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("authentication cancelled")]
    AuthenticationCancelled,

    #[error("too many failed attempts; retry in {retry_after_secs}s")]
    AuthenticationLockedOut { retry_after_secs: u64 },

    #[error("a fresh authentication is required to use the master key")]
    AuthenticationRequired,

    #[error("authenticator unavailable: {0}")]
    AuthenticatorUnavailable(String),

    #[error("master key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("master key invalidated by a biometric enrollment change")]
    KeyInvalidated,

    #[error("master key was invalidated; re-provision the vault before unlocking")]
    ReprovisionRequired,

    #[error("master key is valid; refusing to re-provision")]
    KeyHealthy,

    #[error("integrity check failed for {id} (corrupted or tampered)")]
    IntegrityCheckFailed { id: String },

    #[error("session key cannot be used for this operation")]
    InvalidSessionKey,

    #[error("record {id} is unreadable: {reason}")]
    RecordUnreadable { id: String, reason: UnreadableReason },

    #[error("vault is locked")]
    VaultLocked,

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid record id: {0}")]
    InvalidRecordId(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialisation error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    /// True when the same call may succeed later without re-provisioning or
    /// repairing data (user retry, re-unlock, or waiting out a cooldown).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VaultError::AuthenticationFailed
                | VaultError::AuthenticationCancelled
                | VaultError::AuthenticationLockedOut { .. }
                | VaultError::AuthenticationRequired
                | VaultError::VaultLocked
                | VaultError::NotFound(_)
        )
    }

    pub fn requires_reprovisioning(&self) -> bool {
        matches!(
            self,
            VaultError::KeyInvalidated | VaultError::ReprovisionRequired | VaultError::KeyUnavailable(_)
        )
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        VaultError::Storage(format!("vault worker failed: {err}"))
    }
}
