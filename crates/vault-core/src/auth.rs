//! Authentication gate.
//!
//! The platform prompt is callback style: [`Authenticator::present`] gets a
//! one-shot [`PromptReply`] and answers whenever the user is done. The gate
//! turns that into a single awaited call that also honours cancellation and
//! an attempt timeout, and mints an [`UnlockToken`] on success.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, VaultError};
use crate::key_manager::{KeyManager, SessionKey};
use crate::keystore::{AuthMethod, AuthProof};
use crate::settings::VaultSettings;

/// What the prompt is asked to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub reason: String,
    pub allow_device_credential: bool,
    /// 1-based count of this attempt since the last success.
    pub attempt: u32,
}

#[derive(Debug)]
pub enum PromptOutcome {
    Authenticated(AuthProof),
    /// Credential not recognised.
    Failed,
    /// User dismissed the prompt.
    Cancelled,
    /// The platform refuses further attempts for now.
    LockedOut,
    /// Sensor missing, not enrolled, hardware error.
    Error(String),
}

/// Completion handle for one presented challenge.
pub struct PromptReply(oneshot::Sender<PromptOutcome>);

impl PromptReply {
    /// Deliver the outcome. A gate that has already given up is not an error.
    pub fn send(self, outcome: PromptOutcome) {
        if self.0.send(outcome).is_err() {
            debug!("prompt outcome arrived after the attempt ended");
        }
    }
}

pub trait Authenticator: Send + Sync {
    /// Show `challenge` and eventually answer through `reply`. Must not block.
    fn present(&self, challenge: Challenge, reply: PromptReply);
    /// Tear down a prompt the gate no longer waits for.
    fn dismiss(&self);
}

/// Cloneable cancellation flag for one unlock attempt.
#[derive(Clone)]
pub struct CancelSignal(Arc<watch::Sender<bool>>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        match rx.wait_for(|cancelled| *cancelled).await {
            Ok(_) => {}
            Err(_) => debug!("cancel signal sender dropped"),
        };
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelSignal").field(&self.is_cancelled()).finish()
    }
}

/// Capability proving a recent successful authentication.
pub struct UnlockToken {
    issued_at: Instant,
    last_activity: Instant,
    idle_ttl: Duration,
    session_key: Arc<SessionKey>,
    method: AuthMethod,
}

impl UnlockToken {
    fn new(session_key: SessionKey, method: AuthMethod, idle_ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            issued_at: now,
            last_activity: now,
            idle_ttl,
            session_key: Arc::new(session_key),
            method,
        }
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub fn session_key(&self) -> &Arc<SessionKey> {
        &self.session_key
    }

    pub fn is_expired(&self) -> bool {
        self.last_activity.elapsed() >= self.idle_ttl
    }

    /// Idle time left before the token lapses.
    pub fn expires_in(&self) -> Duration {
        self.idle_ttl.saturating_sub(self.last_activity.elapsed())
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl fmt::Debug for UnlockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockToken")
            .field("method", &self.method)
            .field("key_id", &self.session_key.key_id())
            .field("expires_in", &self.expires_in())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct FailureState {
    consecutive: u32,
    locked_until: Option<Instant>,
}

/// Dismisses the prompt unless an answer came back.
struct PromptGuard<'a> {
    authenticator: &'a dyn Authenticator,
    armed: bool,
}

impl PromptGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.authenticator.dismiss();
        }
    }
}

pub struct AuthGate {
    authenticator: Arc<dyn Authenticator>,
    key_manager: Arc<KeyManager>,
    settings: VaultSettings,
    failures: Mutex<FailureState>,
}

impl AuthGate {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        key_manager: Arc<KeyManager>,
        settings: VaultSettings,
    ) -> Self {
        Self {
            authenticator,
            key_manager,
            settings,
            failures: Mutex::new(FailureState::default()),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.lock().consecutive
    }

    /// Cooldown left after a lockout, if one is running.
    pub fn lockout_remaining(&self) -> Option<Duration> {
        let failures = self.failures.lock();
        failures
            .locked_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    /// Run one authentication ceremony and, on success, unseal the session key.
    pub async fn request_unlock(&self, reason: &str, cancel: &CancelSignal) -> Result<UnlockToken> {
        let attempt = self.check_lockout()?;
        if cancel.is_cancelled() {
            return Err(VaultError::AuthenticationCancelled);
        }

        let key_manager = self.key_manager.clone();
        let master = tokio::task::spawn_blocking(move || key_manager.ensure_key()).await??;

        let challenge = Challenge {
            reason: reason.to_string(),
            allow_device_credential: self.settings.allow_device_credential_fallback,
            attempt,
        };
        let (tx, rx) = oneshot::channel();
        let mut guard = PromptGuard {
            authenticator: &*self.authenticator,
            armed: true,
        };
        debug!(attempt, "presenting unlock challenge");
        self.authenticator.present(challenge, PromptReply(tx));

        let timeout = self.settings.unlock_attempt_timeout();
        let outcome = tokio::select! {
            reply = rx => {
                guard.disarm();
                reply.map_err(|_| {
                    VaultError::AuthenticatorUnavailable("prompt closed without an answer".into())
                })?
            }
            _ = cancel.cancelled() => {
                debug!("unlock attempt cancelled");
                return Err(VaultError::AuthenticationCancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs(), "unlock attempt timed out");
                return Err(VaultError::AuthenticationCancelled);
            }
        };
        drop(guard);

        let proof = match outcome {
            PromptOutcome::Authenticated(proof) => proof,
            PromptOutcome::Failed => return Err(self.record_failure()),
            PromptOutcome::Cancelled => return Err(VaultError::AuthenticationCancelled),
            PromptOutcome::LockedOut => return Err(self.start_lockout()),
            PromptOutcome::Error(msg) => {
                warn!(error = %msg, "authenticator reported an error");
                return Err(VaultError::AuthenticatorUnavailable(msg));
            }
        };
        let method = proof.method();
        if method == AuthMethod::DeviceCredential && !self.settings.allow_device_credential_fallback {
            warn!("device credential offered while fallback is disabled");
            return Err(self.record_failure());
        }

        let key_manager = self.key_manager.clone();
        let session_key =
            tokio::task::spawn_blocking(move || key_manager.derive_session_key(&master, proof))
                .await??;
        *self.failures.lock() = FailureState::default();
        info!(?method, key_id = %session_key.key_id(), "vault unlocked");
        Ok(UnlockToken::new(session_key, method, self.settings.unlock_ttl()))
    }

    /// Fails fast during a cooldown; otherwise returns the attempt number.
    fn check_lockout(&self) -> Result<u32> {
        let mut failures = self.failures.lock();
        if let Some(until) = failures.locked_until {
            let left = until.saturating_duration_since(Instant::now());
            if !left.is_zero() {
                return Err(VaultError::AuthenticationLockedOut {
                    retry_after_secs: ceil_secs(left),
                });
            }
            failures.locked_until = None;
        }
        Ok(failures.consecutive + 1)
    }

    fn record_failure(&self) -> VaultError {
        let consecutive = {
            let mut failures = self.failures.lock();
            failures.consecutive += 1;
            failures.consecutive
        };
        if consecutive >= self.settings.max_auth_attempts_before_lockout {
            return self.start_lockout();
        }
        debug!(consecutive, "authentication failed");
        VaultError::AuthenticationFailed
    }

    fn start_lockout(&self) -> VaultError {
        let cooldown = self.settings.lockout_cooldown();
        let mut failures = self.failures.lock();
        failures.consecutive = 0;
        failures.locked_until = Some(Instant::now() + cooldown);
        warn!(cooldown_secs = cooldown.as_secs(), "authentication locked out");
        VaultError::AuthenticationLockedOut {
            retry_after_secs: cooldown.as_secs(),
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
