use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, VaultError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultSettings {
    /// Idle time after which an unlocked session locks itself.
    pub unlock_ttl_seconds: u64,
    pub allow_device_credential_fallback: bool,
    pub max_auth_attempts_before_lockout: u32,
    pub lockout_cooldown_seconds: u64,
    /// How long a single prompt may stay open before it is dismissed.
    pub unlock_attempt_timeout_seconds: u64,
    pub key_alias: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            unlock_ttl_seconds: 30,
            allow_device_credential_fallback: false,
            max_auth_attempts_before_lockout: 5,
            lockout_cooldown_seconds: 30,
            unlock_attempt_timeout_seconds: 60,
            key_alias: "vault-master-key".into(),
        }
    }
}

impl VaultSettings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        let settings: VaultSettings = serde_json::from_slice(&data)
            .map_err(|e| VaultError::InvalidSettings(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.unlock_ttl_seconds == 0 {
            return Err(VaultError::InvalidSettings(
                "unlock_ttl_seconds must be greater than zero".into(),
            ));
        }
        if self.max_auth_attempts_before_lockout == 0 {
            return Err(VaultError::InvalidSettings(
                "max_auth_attempts_before_lockout must be at least 1".into(),
            ));
        }
        if self.unlock_attempt_timeout_seconds == 0 {
            return Err(VaultError::InvalidSettings(
                "unlock_attempt_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.key_alias.trim().is_empty() {
            return Err(VaultError::InvalidSettings("key_alias is empty".into()));
        }
        Ok(())
    }

    pub fn unlock_ttl(&self) -> Duration {
        Duration::from_secs(self.unlock_ttl_seconds)
    }

    pub fn lockout_cooldown(&self) -> Duration {
        Duration::from_secs(self.lockout_cooldown_seconds)
    }

    pub fn unlock_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.unlock_attempt_timeout_seconds)
    }
}
