//! Scripted [`Authenticator`] for tests and simulations.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::auth::{Authenticator, Challenge, PromptOutcome, PromptReply};
use crate::keystore::{AuthMethod, AuthProof};

/// How the next presented challenge is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Succeed(AuthMethod),
    Fail,
    Cancel,
    LockOut,
    Error(String),
    /// Keep the prompt open until [`ScriptedAuthenticator::complete_pending`].
    Hold,
}

/// Answers challenges from a queue; an empty queue means biometric success.
#[derive(Default)]
pub struct ScriptedAuthenticator {
    script: Mutex<VecDeque<Script>>,
    pending: Mutex<Option<PromptReply>>,
    challenges: Mutex<Vec<Challenge>>,
    presented: AtomicUsize,
    dismissed: AtomicUsize,
}

impl ScriptedAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: Script) {
        self.script.lock().push_back(step);
    }

    pub fn push_all<I: IntoIterator<Item = Script>>(&self, steps: I) {
        self.script.lock().extend(steps);
    }

    pub fn presented(&self) -> usize {
        self.presented.load(Ordering::SeqCst)
    }

    pub fn dismissed(&self) -> usize {
        self.dismissed.load(Ordering::SeqCst)
    }

    pub fn challenges(&self) -> Vec<Challenge> {
        self.challenges.lock().clone()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Answer a held prompt. Returns false if none is open.
    pub fn complete_pending(&self, outcome: PromptOutcome) -> bool {
        match self.pending.lock().take() {
            Some(reply) => {
                reply.send(outcome);
                true
            }
            None => false,
        }
    }
}

impl Authenticator for ScriptedAuthenticator {
    fn present(&self, challenge: Challenge, reply: PromptReply) {
        self.presented.fetch_add(1, Ordering::SeqCst);
        self.challenges.lock().push(challenge);
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(Script::Succeed(AuthMethod::Biometric));
        let outcome = match step {
            Script::Succeed(method) => PromptOutcome::Authenticated(AuthProof::new(method)),
            Script::Fail => PromptOutcome::Failed,
            Script::Cancel => PromptOutcome::Cancelled,
            Script::LockOut => PromptOutcome::LockedOut,
            Script::Error(msg) => PromptOutcome::Error(msg),
            Script::Hold => {
                *self.pending.lock() = Some(reply);
                return;
            }
        };
        reply.send(outcome);
    }

    fn dismiss(&self) {
        self.dismissed.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().take();
    }
}
