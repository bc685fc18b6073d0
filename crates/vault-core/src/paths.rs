use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "meruscrap";
pub const APP_NAME: &str = "vault";

pub const RECORDS_DIR: &str = "records";
pub const KEY_REFERENCE_FILE: &str = "keyref.json";
pub const AUDIT_LOG_FILE: &str = "audit.log";
pub const SETTINGS_FILE: &str = "settings.json";

pub fn data_dir() -> crate::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("VAULT_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        crate::VaultError::Storage("cannot determine data directory".into())
    })?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn records_dir(root: &Path) -> PathBuf {
    root.join(RECORDS_DIR)
}

pub fn key_reference_path(root: &Path) -> PathBuf {
    root.join(KEY_REFERENCE_FILE)
}

pub fn audit_log_path(root: &Path) -> PathBuf {
    root.join(AUDIT_LOG_FILE)
}

pub fn settings_path(root: &Path) -> PathBuf {
    root.join(SETTINGS_FILE)
}
