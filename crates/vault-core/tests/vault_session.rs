//! End-to-end tests for the session controller against real stores.
//!
//! Tests cover:
//!  1. Write, lock, unlock, read back
//!  2. Idle expiry locks the vault
//!  3. Concurrent unlocks share one challenge
//!  4. Enrollment change, re-provisioning and retired records
//!  5. Tampered record fails alone
//!  6. Stale staging file never shows up as a record
//!  7. Audit journal records the session and verifies
//!  8. Locked vault refuses every record operation

use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use vault_core::audit::{events, AuditLog};
use vault_core::paths;
use vault_core::testing::{Script, ScriptedAuthenticator};
use vault_core::{
    AuthMethod, AuthProof, FileVaultStore, MemoryVaultStore, PlaintextRecord, PromptOutcome,
    SessionController, SoftwareKeystore, UnreadableReason, VaultError, VaultSettings, VaultStore,
};

struct Harness {
    keystore: Arc<SoftwareKeystore>,
    auth: Arc<ScriptedAuthenticator>,
    controller: SessionController,
}

fn memory_vault() -> Harness {
    let keystore = Arc::new(SoftwareKeystore::new());
    let auth = Arc::new(ScriptedAuthenticator::new());
    let controller = SessionController::new(
        VaultSettings::default(),
        keystore.clone(),
        auth.clone(),
        Arc::new(MemoryVaultStore::new()),
    )
    .unwrap();
    Harness {
        keystore,
        auth,
        controller,
    }
}

fn file_vault(dir: &std::path::Path) -> Harness {
    let keystore = Arc::new(SoftwareKeystore::new());
    let auth = Arc::new(ScriptedAuthenticator::new());
    let controller = SessionController::open(dir, keystore.clone(), auth.clone()).unwrap();
    Harness {
        keystore,
        auth,
        controller,
    }
}

fn amount(n: i64) -> PlaintextRecord {
    PlaintextRecord::from_json(&json!({ "amount": n })).unwrap()
}

// ─── Test 1: Write, lock, unlock, read back ─────────────────────────────────

#[tokio::test]
async fn test_record_survives_lock_cycle() {
    let dir = tempdir().unwrap();
    let h = file_vault(dir.path());

    h.controller.unlock("record sale").await.unwrap();
    h.controller.write_record("r1", amount(42)).await.unwrap();
    h.controller.lock();
    assert!(!h.controller.is_unlocked());

    h.controller.unlock("review sale").await.unwrap();
    let value: Value = h.controller.read_record("r1").await.unwrap().to_json().unwrap();
    assert_eq!(value, json!({ "amount": 42 }));
    assert_eq!(h.auth.presented(), 2);

    // nothing readable on disk
    let raw = fs::read_dir(paths::records_dir(dir.path()))
        .unwrap()
        .map(|e| fs::read_to_string(e.unwrap().path()).unwrap())
        .collect::<String>();
    assert!(!raw.contains("amount"));
}

// ─── Test 2: Idle expiry ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_idle_expiry_locks_vault() {
    let h = memory_vault();
    h.controller.unlock("x").await.unwrap();
    h.controller.write_record("r1", amount(1)).await.unwrap();

    // activity resets the idle timer
    tokio::time::advance(Duration::from_secs(20)).await;
    h.controller.read_record("r1").await.unwrap();
    tokio::time::advance(Duration::from_secs(20)).await;
    assert!(h.controller.is_unlocked());

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(!h.controller.is_unlocked());
    assert_eq!(
        h.controller.read_record("r1").await.unwrap_err(),
        VaultError::VaultLocked
    );
}

// ─── Test 3: Concurrent unlocks ─────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_unlocks_present_one_challenge() {
    let h = memory_vault();
    h.auth.push(Script::Hold);

    let completer = async {
        while !h.auth.has_pending() {
            tokio::task::yield_now().await;
        }
        h.auth
            .complete_pending(PromptOutcome::Authenticated(AuthProof::new(AuthMethod::Biometric)));
    };
    let (a, b, c, ()) = tokio::join!(
        h.controller.unlock("a"),
        h.controller.unlock("b"),
        h.controller.unlock("c"),
        completer
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(h.auth.presented(), 1);
    assert!(h.controller.is_unlocked());
}

#[tokio::test]
async fn test_concurrent_waiters_share_failure() {
    let h = memory_vault();
    h.auth.push(Script::Hold);

    let completer = async {
        while !h.auth.has_pending() {
            tokio::task::yield_now().await;
        }
        h.auth.complete_pending(PromptOutcome::Failed);
    };
    let (a, b, ()) = tokio::join!(h.controller.unlock("a"), h.controller.unlock("b"), completer);
    assert_eq!(a.unwrap_err(), VaultError::AuthenticationFailed);
    assert_eq!(b.unwrap_err(), VaultError::AuthenticationFailed);
    assert_eq!(h.auth.presented(), 1);
    assert!(!h.controller.is_unlocked());
}

// ─── Test 4: Enrollment change and re-provisioning ─────────────────────────

#[tokio::test]
async fn test_enrollment_change_requires_reprovision() {
    let dir = tempdir().unwrap();
    let h = file_vault(dir.path());

    h.controller.unlock("x").await.unwrap();
    h.controller.write_record("r1", amount(42)).await.unwrap();
    h.controller.lock();

    h.keystore.change_enrollment();
    assert_eq!(h.controller.unlock("x").await.unwrap_err(), VaultError::KeyInvalidated);
    assert_eq!(
        h.controller.unlock("x").await.unwrap_err(),
        VaultError::ReprovisionRequired
    );
    let status = h.controller.status().await.unwrap();
    assert!(status.reprovision_required);
    assert!(status.key.unwrap().invalidated);

    let fresh = h.controller.reprovision().await.unwrap();
    assert_eq!(fresh.generation, 2);
    assert!(!fresh.invalidated);

    h.controller.unlock("x").await.unwrap();
    assert_eq!(
        h.controller.read_record("r1").await.unwrap_err(),
        VaultError::RecordUnreadable {
            id: "r1".into(),
            reason: UnreadableReason::KeyRetired
        }
    );
    assert_eq!(h.controller.list_records().await.unwrap(), vec!["r1".to_string()]);

    // overwriting the retired record makes it readable under the new key
    h.controller.write_record("r1", amount(7)).await.unwrap();
    let value: Value = h.controller.read_record("r1").await.unwrap().to_json().unwrap();
    assert_eq!(value, json!({ "amount": 7 }));
}

#[tokio::test]
async fn test_healthy_key_is_not_reprovisioned() {
    let h = memory_vault();
    h.controller.unlock("x").await.unwrap();
    assert_eq!(h.controller.reprovision().await.unwrap_err(), VaultError::KeyHealthy);
}

// ─── Test 5: Tampered record fails alone ────────────────────────────────────

#[tokio::test]
async fn test_tampered_record_fails_alone() {
    let dir = tempdir().unwrap();
    let h = file_vault(dir.path());
    h.controller.unlock("x").await.unwrap();
    h.controller.write_record("r1", amount(1)).await.unwrap();
    h.controller.write_record("r2", amount(2)).await.unwrap();

    let store = FileVaultStore::open(dir.path()).unwrap();
    let mut record = store.get("r1").unwrap();
    record.ciphertext[0] ^= 0x80;
    store.put("r1", &record).unwrap();

    assert_eq!(
        h.controller.read_record("r1").await.unwrap_err(),
        VaultError::IntegrityCheckFailed { id: "r1".into() }
    );
    let value: Value = h.controller.read_record("r2").await.unwrap().to_json().unwrap();
    assert_eq!(value, json!({ "amount": 2 }));
    assert!(h.controller.is_unlocked());
}

// ─── Test 6: Stale staging file ─────────────────────────────────────────────

#[tokio::test]
async fn test_stale_staging_file_is_not_a_record() {
    let dir = tempdir().unwrap();
    let h = file_vault(dir.path());
    h.controller.unlock("x").await.unwrap();
    h.controller.write_record("r1", amount(1)).await.unwrap();

    fs::write(
        paths::records_dir(dir.path()).join(".staging-crash"),
        b"{\"id\":\"r2\",\"schema_ver",
    )
    .unwrap();
    assert_eq!(h.controller.list_records().await.unwrap(), vec!["r1".to_string()]);
    assert_eq!(
        h.controller.read_record("r2").await.unwrap_err(),
        VaultError::NotFound("r2".into())
    );
}

// ─── Test 7: Audit journal ──────────────────────────────────────────────────

#[tokio::test]
async fn test_audit_journal_records_session() {
    let dir = tempdir().unwrap();
    let h = file_vault(dir.path());
    h.controller.unlock("x").await.unwrap();
    h.controller.write_record("r1", amount(42)).await.unwrap();
    h.controller.delete_record("r1").await.unwrap();
    h.controller.lock();

    let log = AuditLog::new(paths::audit_log_path(dir.path())).unwrap();
    assert!(log.verify().unwrap().is_intact());
    let kinds: Vec<String> = log
        .read_recent(None)
        .unwrap()
        .into_iter()
        .rev()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            events::KEY_PROVISIONED,
            events::UNLOCKED,
            events::RECORD_WRITTEN,
            events::RECORD_DELETED,
            events::LOCKED,
        ]
    );
    let journal = fs::read_to_string(paths::audit_log_path(dir.path())).unwrap();
    assert!(!journal.contains("amount"));
}

// ─── Test 8: Locked vault ───────────────────────────────────────────────────

#[tokio::test]
async fn test_locked_vault_refuses_record_operations() {
    let h = memory_vault();
    assert_eq!(h.controller.read_record("r1").await.unwrap_err(), VaultError::VaultLocked);
    assert_eq!(
        h.controller.write_record("r1", amount(1)).await.unwrap_err(),
        VaultError::VaultLocked
    );
    assert_eq!(h.controller.delete_record("r1").await.unwrap_err(), VaultError::VaultLocked);
    assert_eq!(h.controller.list_records().await.unwrap_err(), VaultError::VaultLocked);
    assert_eq!(h.auth.presented(), 0);
}

#[tokio::test]
async fn test_missing_record_and_bad_ids() {
    let h = memory_vault();
    h.controller.unlock("x").await.unwrap();
    assert_eq!(
        h.controller.read_record("nope").await.unwrap_err(),
        VaultError::NotFound("nope".into())
    );
    assert_eq!(
        h.controller.delete_record("nope").await.unwrap_err(),
        VaultError::NotFound("nope".into())
    );
    assert!(matches!(
        h.controller.write_record("", amount(1)).await,
        Err(VaultError::InvalidRecordId(_))
    ));
}
