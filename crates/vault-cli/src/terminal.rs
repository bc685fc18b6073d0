//! Terminal stand-in for the platform authentication prompt.
//!
//! A terminal has no fingerprint sensor, so the "biometric" path is an
//! explicit presence confirmation. With device-credential fallback enabled
//! and a PIN enrolled (`vault set-pin`), the prompt asks for the PIN instead
//! and checks it against the Argon2 hash kept in the OS keyring.

use anyhow::{anyhow, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use keyring::Entry;
use rand::RngCore;
use std::io::{self, BufRead, Write};
use tracing::debug;
use vault_core::secure_storage::SERVICE_NAME;
use vault_core::{AuthMethod, AuthProof, Authenticator, Challenge, PromptOutcome, PromptReply};

const PIN_ENTRY: &str = "device_pin";
const NO_PIN_STAMP: &str = "no-device-pin";
pub const PIN_ENV: &str = "VAULT_PIN";
pub const PRESENCE_ENV: &str = "VAULT_CONFIRM_PRESENCE";
pub const MIN_PIN_LEN: usize = 4;

fn pin_entry() -> Result<Entry> {
    Entry::new(SERVICE_NAME, PIN_ENTRY).map_err(|e| anyhow!("keyring init: {e}"))
}

pub fn load_pin_hash() -> Result<Option<String>> {
    match pin_entry()?.get_password() {
        Ok(hash) => Ok(Some(hash)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(anyhow!("load device PIN: {e}")),
    }
}

pub fn hash_pin(pin: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| anyhow!("argon2 salt: {e}"))?;
    Ok(Argon2::default()
        .hash_password(pin.as_bytes(), &salt)
        .map_err(|e| anyhow!("argon2 hash: {e}"))?
        .to_string())
}

pub fn store_pin(pin: &str) -> Result<String> {
    let hash = hash_pin(pin)?;
    pin_entry()?
        .set_password(&hash)
        .map_err(|e| anyhow!("store device PIN: {e}"))?;
    Ok(hash)
}

pub fn verify_pin(pin: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| anyhow!("stored PIN hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(pin.as_bytes(), &parsed)
        .is_ok())
}

/// Keys in the keyring are bound to this value; a new PIN means a new
/// enrollment set.
pub fn enrollment_stamp(pin_hash: Option<&str>) -> String {
    pin_hash.unwrap_or(NO_PIN_STAMP).to_string()
}

pub fn read_pin(prompt: &str) -> Result<String> {
    if let Ok(pin) = std::env::var(PIN_ENV) {
        if !pin.is_empty() {
            return Ok(pin);
        }
    }
    rpassword::prompt_password(prompt).map_err(|e| anyhow!("PIN prompt: {e}"))
}

pub struct TerminalAuthenticator {
    pin_hash: Option<String>,
}

impl TerminalAuthenticator {
    pub fn new(pin_hash: Option<String>) -> Self {
        Self { pin_hash }
    }
}

impl Authenticator for TerminalAuthenticator {
    fn present(&self, challenge: Challenge, reply: PromptReply) {
        let pin_hash = self.pin_hash.clone();
        std::thread::spawn(move || reply.send(ask(&challenge, pin_hash.as_deref())));
    }

    fn dismiss(&self) {
        eprintln!();
        eprintln!("unlock prompt dismissed");
    }
}

fn ask(challenge: &Challenge, pin_hash: Option<&str>) -> PromptOutcome {
    eprintln!("Unlock vault: {} (attempt {})", challenge.reason, challenge.attempt);
    match pin_hash {
        Some(hash) if challenge.allow_device_credential => ask_pin(hash),
        _ => ask_presence(),
    }
}

fn ask_pin(hash: &str) -> PromptOutcome {
    let pin = match read_pin("Device PIN (empty to cancel): ") {
        Ok(pin) => pin,
        Err(e) => return PromptOutcome::Error(e.to_string()),
    };
    if pin.is_empty() {
        return PromptOutcome::Cancelled;
    }
    match verify_pin(&pin, hash) {
        Ok(true) => PromptOutcome::Authenticated(AuthProof::new(AuthMethod::DeviceCredential)),
        Ok(false) => PromptOutcome::Failed,
        Err(e) => PromptOutcome::Error(e.to_string()),
    }
}

fn ask_presence() -> PromptOutcome {
    if std::env::var(PRESENCE_ENV).as_deref() == Ok("1") {
        debug!("presence confirmed from environment");
        return PromptOutcome::Authenticated(AuthProof::new(AuthMethod::Biometric));
    }
    eprint!("Confirm presence [y/N]: ");
    if let Err(e) = io::stderr().flush() {
        return PromptOutcome::Error(e.to_string());
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) if matches!(answer.trim(), "y" | "Y" | "yes") => {
            PromptOutcome::Authenticated(AuthProof::new(AuthMethod::Biometric))
        }
        Ok(_) => PromptOutcome::Cancelled,
        Err(e) => PromptOutcome::Error(format!("read confirmation: {e}")),
    }
}
