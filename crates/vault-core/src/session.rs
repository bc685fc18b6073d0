//! Session lifecycle: `Locked -> Unlocking -> Unlocked -> Locked`.
//!
//! State transitions are linearised behind one mutex that is never held
//! across an await. Record operations are serialised behind an async mutex
//! and run their crypto and file I/O on the blocking pool, so a commit that
//! has started finishes even if the caller goes away.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit::{events, AuditLog, AuditSeverity};
use crate::auth::{AuthGate, Authenticator, CancelSignal, UnlockToken};
use crate::codec::CipherCodec;
use crate::error::{Result, VaultError};
use crate::key_manager::{KeyManager, KeyReference, SessionKey};
use crate::keystore::SecureKeystore;
use crate::paths;
use crate::record::{validate_record_id, PlaintextRecord};
use crate::settings::VaultSettings;
use crate::store::{FileVaultStore, VaultStore};

type UnlockOutcome = Option<Result<()>>;

enum Phase {
    Locked,
    Unlocking {
        outcome: watch::Receiver<UnlockOutcome>,
        cancel: CancelSignal,
    },
    Unlocked(UnlockToken),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Locked,
    Unlocking,
    Unlocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub state: SessionState,
    pub key: Option<KeyReference>,
    pub reprovision_required: bool,
    pub record_count: usize,
    pub idle_expires_in_secs: Option<u64>,
    pub lockout_remaining_secs: Option<u64>,
}

enum UnlockEntry {
    Ready,
    Join(watch::Receiver<UnlockOutcome>),
    Lead(watch::Sender<UnlockOutcome>, CancelSignal),
}

/// Resets `Unlocking` to `Locked` if the leading unlock future is dropped
/// before it finishes.
struct UnlockAttempt<'a> {
    controller: &'a SessionController,
    finished: bool,
}

impl Drop for UnlockAttempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut phase = self.controller.phase.lock();
        if matches!(*phase, Phase::Unlocking { .. }) {
            *phase = Phase::Locked;
            debug!("unlock attempt abandoned");
        }
    }
}

pub struct SessionController {
    settings: VaultSettings,
    key_manager: Arc<KeyManager>,
    gate: AuthGate,
    store: Arc<dyn VaultStore>,
    audit: Option<Arc<AuditLog>>,
    phase: Mutex<Phase>,
    io: tokio::sync::Mutex<()>,
    reprovision_required: AtomicBool,
}

impl SessionController {
    pub fn new(
        settings: VaultSettings,
        keystore: Arc<dyn SecureKeystore>,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn VaultStore>,
    ) -> Result<Self> {
        settings.validate()?;
        let key_manager = Arc::new(KeyManager::new(
            keystore,
            store.clone(),
            settings.key_alias.clone(),
        ));
        let gate = AuthGate::new(authenticator, key_manager.clone(), settings.clone());
        Ok(Self {
            settings,
            key_manager,
            gate,
            store,
            audit: None,
            phase: Mutex::new(Phase::Locked),
            io: tokio::sync::Mutex::new(()),
            reprovision_required: AtomicBool::new(false),
        })
    }

    /// File-backed vault rooted at `data_dir` with settings and audit journal
    /// taken from their usual places inside it.
    pub fn open(
        data_dir: &Path,
        keystore: Arc<dyn SecureKeystore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        let settings = VaultSettings::load(paths::settings_path(data_dir))?;
        let store = Arc::new(FileVaultStore::open(data_dir)?);
        let audit = Arc::new(AuditLog::new(paths::audit_log_path(data_dir))?);
        Ok(Self::new(settings, keystore, authenticator, store)?.with_audit(audit))
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    /// Make sure a master key exists, provisioning one on first use.
    pub async fn initialize(&self) -> Result<KeyReference> {
        let key_manager = self.key_manager.clone();
        let result = tokio::task::spawn_blocking(move || {
            let existed = key_manager.key_reference()?.is_some();
            key_manager.ensure_key()?;
            let reference = key_manager.key_reference()?.ok_or_else(|| {
                VaultError::KeyUnavailable("key reference missing after provisioning".into())
            })?;
            Ok::<_, VaultError>((reference, !existed))
        })
        .await?;
        let (reference, created) = result.map_err(|e| self.note_error(e))?;
        if created {
            self.audit(
                events::KEY_PROVISIONED,
                AuditSeverity::Info,
                json!({ "key_id": reference.key_id, "generation": reference.generation }),
            );
        }
        Ok(reference)
    }

    /// Unlock the vault. Concurrent callers share one challenge and all see
    /// its outcome. Returns immediately if already unlocked.
    pub async fn unlock(&self, reason: &str) -> Result<()> {
        let (entry, expired) = {
            let mut phase = self.phase.lock();
            let expired = self.expire_if_idle(&mut phase);
            let entry = match &mut *phase {
                Phase::Unlocked(token) => {
                    token.touch();
                    UnlockEntry::Ready
                }
                Phase::Unlocking { outcome, .. } => UnlockEntry::Join(outcome.clone()),
                Phase::Locked => {
                    let (tx, rx) = watch::channel(None);
                    let cancel = CancelSignal::new();
                    *phase = Phase::Unlocking {
                        outcome: rx,
                        cancel: cancel.clone(),
                    };
                    UnlockEntry::Lead(tx, cancel)
                }
            };
            (entry, expired)
        };
        if expired {
            self.audit_expiry();
        }
        let (tx, cancel) = match entry {
            UnlockEntry::Ready => return Ok(()),
            UnlockEntry::Join(outcome) => return Self::join_unlock(outcome).await,
            UnlockEntry::Lead(tx, cancel) => (tx, cancel),
        };

        let mut attempt = UnlockAttempt {
            controller: self,
            finished: false,
        };
        let result = self.run_unlock(reason, &cancel).await;
        let outcome = {
            let mut phase = self.phase.lock();
            attempt.finished = true;
            match result {
                Ok(token) => {
                    *phase = Phase::Unlocked(token);
                    Ok(())
                }
                Err(e) => {
                    *phase = Phase::Locked;
                    Err(e)
                }
            }
        };
        tx.send_replace(Some(outcome.clone()));

        match &outcome {
            Ok(()) => self.audit(events::UNLOCKED, AuditSeverity::Info, json!({ "reason": reason })),
            Err(e) => self.audit(
                events::UNLOCK_FAILED,
                AuditSeverity::Warn,
                json!({ "reason": reason, "error": e.to_string() }),
            ),
        }
        outcome
    }

    async fn run_unlock(&self, reason: &str, cancel: &CancelSignal) -> Result<UnlockToken> {
        self.initialize().await?;
        self.gate
            .request_unlock(reason, cancel)
            .await
            .map_err(|e| self.note_error(e))
    }

    async fn join_unlock(mut outcome: watch::Receiver<UnlockOutcome>) -> Result<()> {
        debug!("joining in-flight unlock");
        match outcome.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or(Err(VaultError::AuthenticationCancelled)),
            // leader went away without an answer
            Err(_) => Err(VaultError::AuthenticationCancelled),
        }
    }

    /// Abort the in-flight unlock, if any.
    pub fn cancel_unlock(&self) -> bool {
        match &*self.phase.lock() {
            Phase::Unlocking { cancel, .. } => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn lock(&self) {
        self.lock_with("explicit");
    }

    /// The host process moved to the background.
    pub fn on_background(&self) {
        self.lock_with("background");
    }

    fn lock_with(&self, cause: &'static str) {
        let was_unlocked = {
            let mut phase = self.phase.lock();
            match &*phase {
                Phase::Unlocked(_) => {
                    *phase = Phase::Locked;
                    true
                }
                Phase::Unlocking { cancel, .. } => {
                    cancel.cancel();
                    false
                }
                Phase::Locked => false,
            }
        };
        if was_unlocked {
            info!(cause, "vault locked");
            self.audit(events::LOCKED, AuditSeverity::Info, json!({ "cause": cause }));
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == SessionState::Unlocked
    }

    pub fn state(&self) -> SessionState {
        let (state, expired) = {
            let mut phase = self.phase.lock();
            let expired = self.expire_if_idle(&mut phase);
            let state = match &*phase {
                Phase::Locked => SessionState::Locked,
                Phase::Unlocking { .. } => SessionState::Unlocking,
                Phase::Unlocked(_) => SessionState::Unlocked,
            };
            (state, expired)
        };
        if expired {
            self.audit_expiry();
        }
        state
    }

    pub async fn read_record(&self, id: &str) -> Result<PlaintextRecord> {
        validate_record_id(id)?;
        let _io = self.io.lock().await;
        let key = self.session_key()?;
        let store = self.store.clone();
        let owned = id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let record = store.get(&owned)?;
            CipherCodec::decrypt(&key, &record)
        })
        .await?;
        result.map_err(|e| self.note_error(e))
    }

    pub async fn write_record(&self, id: &str, data: PlaintextRecord) -> Result<()> {
        validate_record_id(id)?;
        let _io = self.io.lock().await;
        let key = self.session_key()?;
        let store = self.store.clone();
        let owned = id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let record = CipherCodec::encrypt(&key, &owned, &data)?;
            store.put(&owned, &record)
        })
        .await?;
        result.map_err(|e| self.note_error(e))?;
        debug!(id, "record written");
        self.audit(events::RECORD_WRITTEN, AuditSeverity::Info, json!({ "id": id }));
        Ok(())
    }

    pub async fn delete_record(&self, id: &str) -> Result<()> {
        validate_record_id(id)?;
        let _io = self.io.lock().await;
        self.session_key()?;
        let store = self.store.clone();
        let owned = id.to_string();
        tokio::task::spawn_blocking(move || store.delete(&owned)).await??;
        debug!(id, "record deleted");
        self.audit(events::RECORD_DELETED, AuditSeverity::Info, json!({ "id": id }));
        Ok(())
    }

    /// Identifiers of every stored record, including ones that can no longer
    /// be opened.
    pub async fn list_records(&self) -> Result<Vec<String>> {
        let _io = self.io.lock().await;
        self.session_key()?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list()).await?
    }

    /// Replace an invalidated master key. Locks the session first; records
    /// sealed under the old key remain listed but unreadable.
    pub async fn reprovision(&self) -> Result<KeyReference> {
        self.lock_with("reprovision");
        let _io = self.io.lock().await;
        let key_manager = self.key_manager.clone();
        let master = tokio::task::spawn_blocking(move || key_manager.reprovision()).await??;
        self.reprovision_required.store(false, Ordering::SeqCst);
        self.audit(
            events::KEY_REPROVISIONED,
            AuditSeverity::Warn,
            json!({ "key_id": master.key_id(), "generation": master.generation() }),
        );
        let key_manager = self.key_manager.clone();
        tokio::task::spawn_blocking(move || key_manager.key_reference())
            .await??
            .ok_or_else(|| VaultError::KeyUnavailable("key reference missing after reprovisioning".into()))
    }

    pub async fn status(&self) -> Result<VaultStatus> {
        let state = self.state();
        let idle_expires_in_secs = match &*self.phase.lock() {
            Phase::Unlocked(token) => Some(token.expires_in().as_secs()),
            _ => None,
        };
        let key_manager = self.key_manager.clone();
        let store = self.store.clone();
        let (key, record_count) = tokio::task::spawn_blocking(move || {
            Ok::<_, VaultError>((key_manager.key_reference()?, store.list()?.len()))
        })
        .await??;
        let reprovision_required = self.reprovision_required.load(Ordering::SeqCst)
            || key.as_ref().is_some_and(|k| k.invalidated);
        Ok(VaultStatus {
            state,
            key,
            reprovision_required,
            record_count,
            idle_expires_in_secs,
            lockout_remaining_secs: self.gate.lockout_remaining().map(|d| d.as_secs().max(1)),
        })
    }

    /// Session key for one record operation; resets the idle timer. Callers
    /// hold `io` so a lock that lands while they queue is honoured.
    fn session_key(&self) -> Result<Arc<SessionKey>> {
        let (key, expired) = {
            let mut phase = self.phase.lock();
            let expired = self.expire_if_idle(&mut phase);
            let key = match &mut *phase {
                Phase::Unlocked(token) => {
                    token.touch();
                    Ok(token.session_key().clone())
                }
                _ => Err(VaultError::VaultLocked),
            };
            (key, expired)
        };
        if expired {
            self.audit_expiry();
        }
        key
    }

    fn expire_if_idle(&self, phase: &mut Phase) -> bool {
        if let Phase::Unlocked(token) = phase {
            if token.is_expired() {
                *phase = Phase::Locked;
                return true;
            }
        }
        false
    }

    fn audit_expiry(&self) {
        info!("vault locked after idle timeout");
        self.audit(events::SESSION_EXPIRED, AuditSeverity::Info, json!({}));
    }

    /// Side effects of an error before it is handed back to the caller.
    fn note_error(&self, err: VaultError) -> VaultError {
        match &err {
            VaultError::KeyInvalidated => {
                self.reprovision_required.store(true, Ordering::SeqCst);
                self.lock_with("key-invalidated");
                self.audit(events::KEY_INVALIDATED, AuditSeverity::Critical, json!({}));
            }
            VaultError::ReprovisionRequired => {
                self.reprovision_required.store(true, Ordering::SeqCst);
            }
            VaultError::InvalidSessionKey => {
                warn!("session key rejected; re-unlock required");
                self.lock_with("session-key");
            }
            VaultError::IntegrityCheckFailed { id } => {
                warn!(id = %id, "record failed integrity check");
                self.audit(events::INTEGRITY_FAILURE, AuditSeverity::Critical, json!({ "id": id }));
            }
            VaultError::RecordUnreadable { id, reason } => {
                warn!(id = %id, %reason, "record unreadable");
            }
            _ => {}
        }
        err
    }

    fn audit(&self, event: &str, severity: AuditSeverity, data: serde_json::Value) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.append(event, severity, data) {
                warn!(event, error = %e, "audit append failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PromptOutcome;
    use crate::keystore::{AuthMethod, AuthProof, SoftwareKeystore};
    use crate::store::MemoryVaultStore;
    use crate::testing::{Script, ScriptedAuthenticator};
    use std::time::Duration;
    use uuid::Uuid;

    fn controller() -> (Arc<ScriptedAuthenticator>, SessionController) {
        let (auth, _, controller) = controller_with_store();
        (auth, controller)
    }

    fn controller_with_store() -> (Arc<ScriptedAuthenticator>, Arc<MemoryVaultStore>, SessionController) {
        let auth = Arc::new(ScriptedAuthenticator::new());
        let store = Arc::new(MemoryVaultStore::new());
        let controller = SessionController::new(
            VaultSettings::default(),
            Arc::new(SoftwareKeystore::new()),
            auth.clone(),
            store.clone(),
        )
        .unwrap();
        (auth, store, controller)
    }

    #[tokio::test]
    async fn lock_while_queued_refuses_pending_read_and_write() {
        let (_, controller) = controller();
        controller.unlock("x").await.unwrap();
        controller
            .write_record("r1", PlaintextRecord::from("secret"))
            .await
            .unwrap();

        let held = controller.io.lock().await;
        let mut read = Box::pin(controller.read_record("r1"));
        let mut write = Box::pin(controller.write_record("r2", PlaintextRecord::from("late")));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut read).await.is_err());
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut write).await.is_err());

        controller.lock();
        assert!(!controller.is_unlocked());
        drop(held);

        assert_eq!(read.await.unwrap_err(), VaultError::VaultLocked);
        assert_eq!(write.await.unwrap_err(), VaultError::VaultLocked);
    }

    #[tokio::test]
    async fn rewritten_key_id_fails_only_that_record() {
        let (_, store, controller) = controller_with_store();
        controller.unlock("x").await.unwrap();
        for id in ["r1", "r2"] {
            controller
                .write_record(id, PlaintextRecord::from("{}"))
                .await
                .unwrap();
        }
        let mut tampered = store.get("r1").unwrap();
        tampered.key_id = Uuid::new_v4();
        store.put("r1", &tampered).unwrap();

        assert_eq!(
            controller.read_record("r1").await.unwrap_err(),
            VaultError::IntegrityCheckFailed { id: "r1".into() }
        );
        assert!(controller.is_unlocked());
        assert_eq!(controller.read_record("r2").await.unwrap().as_bytes(), b"{}");
    }

    #[tokio::test]
    async fn enabling_device_credential_later_unlocks_existing_key() {
        let keystore = Arc::new(SoftwareKeystore::new());
        let store = Arc::new(MemoryVaultStore::new());
        let first = SessionController::new(
            VaultSettings::default(),
            keystore.clone(),
            Arc::new(ScriptedAuthenticator::new()),
            store.clone(),
        )
        .unwrap();
        first.initialize().await.unwrap();

        let auth = Arc::new(ScriptedAuthenticator::new());
        auth.push(Script::Succeed(AuthMethod::DeviceCredential));
        let settings = VaultSettings {
            allow_device_credential_fallback: true,
            ..VaultSettings::default()
        };
        let second = SessionController::new(settings, keystore, auth.clone(), store).unwrap();
        second.unlock("x").await.unwrap();
        assert!(second.is_unlocked());
        assert!(auth.challenges()[0].allow_device_credential);
    }

    #[tokio::test]
    async fn dropped_unlock_returns_to_locked() {
        let (auth, controller) = controller();
        auth.push(Script::Hold);
        let attempt = controller.unlock("x");
        let timed_out = tokio::time::timeout(Duration::from_millis(200), attempt).await;
        assert!(timed_out.is_err());
        assert_eq!(controller.state(), SessionState::Locked);
        assert_eq!(auth.dismissed(), 1);

        controller.unlock("again").await.unwrap();
        assert!(controller.is_unlocked());
    }

    #[tokio::test]
    async fn cancel_unlock_aborts_every_waiter() {
        let (auth, controller) = controller();
        auth.push(Script::Hold);
        let canceller = async {
            while !auth.has_pending() {
                tokio::task::yield_now().await;
            }
            assert_eq!(controller.state(), SessionState::Unlocking);
            assert!(controller.cancel_unlock());
        };
        let (a, b, ()) = tokio::join!(controller.unlock("a"), controller.unlock("b"), canceller);
        assert_eq!(a.unwrap_err(), VaultError::AuthenticationCancelled);
        assert_eq!(b.unwrap_err(), VaultError::AuthenticationCancelled);
        assert_eq!(auth.presented(), 1);
        assert!(!controller.cancel_unlock());
        assert_eq!(controller.state(), SessionState::Locked);
    }

    #[tokio::test]
    async fn background_locks() {
        let (_, controller) = controller();
        controller.unlock("x").await.unwrap();
        controller.on_background();
        assert_eq!(
            controller.list_records().await.unwrap_err(),
            VaultError::VaultLocked
        );
    }

    #[tokio::test]
    async fn held_prompt_completes_for_all_waiters() {
        let (auth, controller) = controller();
        auth.push(Script::Hold);
        let completer = async {
            while !auth.has_pending() {
                tokio::task::yield_now().await;
            }
            assert!(auth.complete_pending(PromptOutcome::Authenticated(AuthProof::new(
                AuthMethod::Biometric
            ))));
        };
        let (a, b, ()) = tokio::join!(controller.unlock("a"), controller.unlock("b"), completer);
        a.unwrap();
        b.unwrap();
        assert_eq!(auth.presented(), 1);
    }

    #[tokio::test]
    async fn status_reports_state_and_counts() {
        let (_, controller) = controller();
        let status = controller.status().await.unwrap();
        assert_eq!(status.state, SessionState::Locked);
        assert!(status.key.is_none());

        controller.unlock("x").await.unwrap();
        controller
            .write_record("r1", PlaintextRecord::from("{}"))
            .await
            .unwrap();
        let status = controller.status().await.unwrap();
        assert_eq!(status.state, SessionState::Unlocked);
        assert_eq!(status.record_count, 1);
        assert_eq!(status.key.unwrap().generation, 1);
        assert!(!status.reprovision_required);
        assert!(status.idle_expires_in_secs.is_some());
    }
}
