//! Persistence of sealed records. No cryptography happens here.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, VaultError};
use crate::key_manager::KeyReference;
use crate::paths;
use crate::record::{validate_record_id, EncryptedRecord};

const RECORD_EXT: &str = "rec";
const STAGING_PREFIX: &str = ".staging-";

pub trait VaultStore: Send + Sync {
    /// Store `record` under `id`, replacing any previous record entirely.
    fn put(&self, id: &str, record: &EncryptedRecord) -> Result<()>;
    fn get(&self, id: &str) -> Result<EncryptedRecord>;
    fn delete(&self, id: &str) -> Result<()>;
    /// All record ids, sorted.
    fn list(&self) -> Result<Vec<String>>;

    fn load_key_reference(&self) -> Result<Option<KeyReference>>;
    fn save_key_reference(&self, reference: &KeyReference) -> Result<()>;
}

fn check_put(id: &str, record: &EncryptedRecord) -> Result<()> {
    validate_record_id(id)?;
    if record.id != id {
        return Err(VaultError::InvalidRecordId(format!(
            "record sealed for {} cannot be stored as {id}",
            record.id
        )));
    }
    Ok(())
}

/// One file per record; every write goes through a staging file and an
/// atomic rename so a crash leaves either the old or the new record.
pub struct FileVaultStore {
    records_dir: PathBuf,
    key_reference_path: PathBuf,
}

impl FileVaultStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let records_dir = paths::records_dir(root);
        fs::create_dir_all(&records_dir)?;
        restrict_dir_permissions(root);
        restrict_dir_permissions(&records_dir);
        cleanup_staging(root);
        cleanup_staging(&records_dir);
        Ok(Self {
            records_dir,
            key_reference_path: paths::key_reference_path(root),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.records_dir
            .join(format!("{}.{RECORD_EXT}", hex::encode(id.as_bytes())))
    }
}

impl VaultStore for FileVaultStore {
    fn put(&self, id: &str, record: &EncryptedRecord) -> Result<()> {
        check_put(id, record)?;
        let data = serde_json::to_vec(record)?;
        write_atomic(&self.record_path(id), &data)?;
        debug!(id, "record committed");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<EncryptedRecord> {
        validate_record_id(id)?;
        let data = match fs::read(self.record_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VaultError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let record: EncryptedRecord = serde_json::from_slice(&data).map_err(|e| {
            warn!(id, error = %e, "stored record is not parseable");
            VaultError::IntegrityCheckFailed { id: id.to_string() }
        })?;
        if record.id != id {
            warn!(id, stored_id = %record.id, "stored record id does not match its file");
            return Err(VaultError::IntegrityCheckFailed { id: id.to_string() });
        }
        Ok(record)
    }

    fn delete(&self, id: &str) -> Result<()> {
        validate_record_id(id)?;
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => {
                fsync_dir(&self.records_dir)?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(VaultError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.records_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match hex::decode(stem).ok().and_then(|raw| String::from_utf8(raw).ok()) {
                Some(id) => ids.push(id),
                None => warn!(path = %path.display(), "ignoring record file with undecodable name"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_key_reference(&self) -> Result<Option<KeyReference>> {
        match fs::read(&self.key_reference_path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_key_reference(&self, reference: &KeyReference) -> Result<()> {
        let data = serde_json::to_vec_pretty(reference)?;
        write_atomic(&self.key_reference_path, &data)
    }
}

/// Write `data` to a staging file next to `dest`, fsync it, rename it over
/// `dest` and fsync the directory.
fn write_atomic(dest: &Path, data: &[u8]) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| VaultError::Storage(format!("{} has no parent", dest.display())))?;
    let mut staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(dir)?;
    staging.write_all(data)?;
    staging.as_file().sync_all()?;
    staging.persist(dest).map_err(|e| VaultError::from(e.error))?;
    fsync_dir(dir)
}

fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Remove staging files left behind by a crash mid-write.
fn cleanup_staging(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            warn!(path = %entry.path().display(), "removing orphaned staging file");
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "cannot remove staging file");
            }
        }
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!(path = %path.display(), error = %e, "cannot restrict directory permissions");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// In-process store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryVaultStore {
    records: RwLock<BTreeMap<String, EncryptedRecord>>,
    key_reference: RwLock<Option<KeyReference>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VaultStore for MemoryVaultStore {
    fn put(&self, id: &str, record: &EncryptedRecord) -> Result<()> {
        check_put(id, record)?;
        self.records.write().insert(id.to_string(), record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<EncryptedRecord> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(id.to_string()))
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.records
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| VaultError::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    fn load_key_reference(&self) -> Result<Option<KeyReference>> {
        Ok(self.key_reference.read().clone())
    }

    fn save_key_reference(&self, reference: &KeyReference) -> Result<()> {
        *self.key_reference.write() = Some(reference.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyAlgorithm;
    use crate::record::SCHEMA_VERSION;
    use chrono::Utc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn sample(id: &str, fill: u8) -> EncryptedRecord {
        EncryptedRecord {
            id: id.to_string(),
            schema_version: SCHEMA_VERSION,
            key_id: Uuid::nil(),
            key_generation: 1,
            nonce: vec![fill; 12],
            ciphertext: vec![fill; 40],
            tag: vec![fill; 16],
        }
    }

    fn reference() -> KeyReference {
        KeyReference {
            alias: "k".into(),
            key_id: Uuid::new_v4(),
            generation: 1,
            algorithm: KeyAlgorithm::Aes256Gcm,
            created_at: Utc::now(),
            invalidated: false,
            invalidated_at: None,
        }
    }

    fn exercise(store: &dyn VaultStore) {
        assert_eq!(store.get("r1").unwrap_err(), VaultError::NotFound("r1".into()));
        store.put("r1", &sample("r1", 1)).unwrap();
        store.put("b/../odd id", &sample("b/../odd id", 2)).unwrap();
        assert_eq!(store.get("r1").unwrap(), sample("r1", 1));

        store.put("r1", &sample("r1", 3)).unwrap();
        assert_eq!(store.get("r1").unwrap(), sample("r1", 3));
        assert_eq!(store.list().unwrap(), vec!["b/../odd id".to_string(), "r1".to_string()]);

        store.delete("r1").unwrap();
        assert_eq!(store.delete("r1").unwrap_err(), VaultError::NotFound("r1".into()));
        assert_eq!(store.list().unwrap(), vec!["b/../odd id".to_string()]);

        assert!(matches!(
            store.put("r9", &sample("r1", 1)),
            Err(VaultError::InvalidRecordId(_))
        ));

        assert!(store.load_key_reference().unwrap().is_none());
        let reference = reference();
        store.save_key_reference(&reference).unwrap();
        assert_eq!(store.load_key_reference().unwrap(), Some(reference));
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryVaultStore::new());
    }

    #[test]
    fn file_store_contract() {
        let dir = tempdir().unwrap();
        exercise(&FileVaultStore::open(dir.path()).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileVaultStore::open(dir.path()).unwrap();
            store.put("r1", &sample("r1", 5)).unwrap();
        }
        let store = FileVaultStore::open(dir.path()).unwrap();
        assert_eq!(store.get("r1").unwrap(), sample("r1", 5));
    }

    #[test]
    fn leftover_staging_files_are_cleaned_and_never_listed() {
        let dir = tempdir().unwrap();
        let store = FileVaultStore::open(dir.path()).unwrap();
        store.put("r1", &sample("r1", 1)).unwrap();

        let records = paths::records_dir(dir.path());
        let orphan = records.join(format!("{STAGING_PREFIX}abc123"));
        fs::write(&orphan, b"{\"id\":\"r1\",\"half").unwrap();
        assert_eq!(store.list().unwrap(), vec!["r1".to_string()]);
        assert_eq!(store.get("r1").unwrap(), sample("r1", 1));

        drop(store);
        FileVaultStore::open(dir.path()).unwrap();
        assert!(!orphan.exists());
    }

    #[test]
    fn corrupted_file_reports_integrity_failure() {
        let dir = tempdir().unwrap();
        let store = FileVaultStore::open(dir.path()).unwrap();
        store.put("r1", &sample("r1", 1)).unwrap();
        fs::write(store.record_path("r1"), b"not json").unwrap();
        assert_eq!(
            store.get("r1").unwrap_err(),
            VaultError::IntegrityCheckFailed { id: "r1".into() }
        );
    }

    #[test]
    fn record_files_hold_no_plaintext_ids() {
        let dir = tempdir().unwrap();
        let store = FileVaultStore::open(dir.path()).unwrap();
        store.put("customer-ledger", &sample("customer-ledger", 1)).unwrap();
        let names: Vec<String> = fs::read_dir(paths::records_dir(dir.path()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.rec", hex::encode("customer-ledger"))]);
    }
}
