use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vault_core::audit::{verify_file, AuditLog};
use vault_core::paths;
use vault_core::{
    FileVaultStore, KeyringKeystore, PlaintextRecord, SessionController, VaultSettings, VaultStore,
};

mod terminal;

use crate::terminal::{
    enrollment_stamp, load_pin_hash, read_pin, store_pin, TerminalAuthenticator, MIN_PIN_LEN,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Biometric-gated encrypted record vault", long_about = None)]
struct Cli {
    /// Vault data directory (defaults to VAULT_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the data directory, default settings and the master key
    Init,
    /// Show key and record state without unlocking
    Status,
    /// Store a JSON record (inline JSON or @path)
    Put { id: String, value: String },
    /// Print a record
    Get { id: String },
    /// Delete a record
    Delete { id: String },
    /// List record identifiers
    List,
    /// Replace an invalidated master key
    Reprovision,
    /// Show recent audit entries
    Audit {
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Verify the hash chain instead of listing entries
        #[arg(long)]
        verify: bool,
    },
    /// Enroll or replace the device PIN used for credential fallback
    SetPin,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let data = match cli.data_dir {
        Some(dir) => dir,
        None => paths::data_dir()?,
    };
    match cli.command {
        Commands::Init => init_command(&data).await,
        Commands::Status => status_command(&data),
        Commands::Put { id, value } => put_command(&data, &id, &value).await,
        Commands::Get { id } => get_command(&data, &id).await,
        Commands::Delete { id } => delete_command(&data, &id).await,
        Commands::List => list_command(&data).await,
        Commands::Reprovision => reprovision_command(&data).await,
        Commands::Audit { limit, verify } => audit_command(&data, limit, verify),
        Commands::SetPin => set_pin_command(),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_vault(data: &Path) -> Result<SessionController> {
    std::fs::create_dir_all(data)?;
    let pin_hash = load_pin_hash()?;
    let keystore = KeyringKeystore::new(enrollment_stamp(pin_hash.as_deref()));
    let authenticator = TerminalAuthenticator::new(pin_hash);
    Ok(SessionController::open(
        data,
        Arc::new(keystore),
        Arc::new(authenticator),
    )?)
}

async fn init_command(data: &Path) -> Result<()> {
    std::fs::create_dir_all(data)?;
    let settings_path = paths::settings_path(data);
    if !settings_path.exists() {
        VaultSettings::default().save(&settings_path)?;
        info!(path = %settings_path.display(), "default settings written");
    }
    let vault = open_vault(data)?;
    let reference = vault.initialize().await?;
    println!("{}", serde_json::to_string_pretty(&reference)?);
    Ok(())
}

/// Reads only the key reference and the record index; never touches the
/// keystore.
fn status_command(data: &Path) -> Result<()> {
    let settings = VaultSettings::load(paths::settings_path(data))?;
    let store = FileVaultStore::open(data)?;
    let key = store.load_key_reference()?;
    let status = json!({
        "data_dir": data.display().to_string(),
        "initialized": key.is_some(),
        "reprovision_required": key.as_ref().map(|k| k.invalidated).unwrap_or(false),
        "key": key,
        "record_count": store.list()?.len(),
        "settings": settings,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn read_value(value: &str) -> Result<PlaintextRecord> {
    let text = match value.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("read {path}"))?,
        None => value.to_string(),
    };
    let parsed: Value = serde_json::from_str(&text).context("record value must be JSON")?;
    Ok(PlaintextRecord::from_json(&parsed)?)
}

async fn put_command(data: &Path, id: &str, value: &str) -> Result<()> {
    let record = read_value(value)?;
    let vault = open_vault(data)?;
    vault.unlock(&format!("store record {id}")).await?;
    let result = vault.write_record(id, record).await;
    vault.lock();
    result?;
    println!("stored {id}");
    Ok(())
}

async fn get_command(data: &Path, id: &str) -> Result<()> {
    let vault = open_vault(data)?;
    vault.unlock(&format!("read record {id}")).await?;
    let result = vault.read_record(id).await;
    vault.lock();
    let record = result?;
    match record.to_json::<Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", String::from_utf8_lossy(record.as_bytes())),
    }
    Ok(())
}

async fn delete_command(data: &Path, id: &str) -> Result<()> {
    let vault = open_vault(data)?;
    vault.unlock(&format!("delete record {id}")).await?;
    let result = vault.delete_record(id).await;
    vault.lock();
    result?;
    println!("deleted {id}");
    Ok(())
}

async fn list_command(data: &Path) -> Result<()> {
    let vault = open_vault(data)?;
    vault.unlock("list records").await?;
    let result = vault.list_records().await;
    vault.lock();
    for id in result? {
        println!("{id}");
    }
    Ok(())
}

async fn reprovision_command(data: &Path) -> Result<()> {
    let vault = open_vault(data)?;
    let reference = vault.reprovision().await?;
    eprintln!("records sealed under earlier keys are no longer readable");
    println!("{}", serde_json::to_string_pretty(&reference)?);
    Ok(())
}

fn audit_command(data: &Path, limit: usize, verify: bool) -> Result<()> {
    let path = paths::audit_log_path(data);
    if verify {
        let report = verify_file(&path)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.is_intact() {
            return Err(anyhow!("audit chain broken at line {:?}", report.first_break));
        }
        return Ok(());
    }
    if !path.exists() {
        return Ok(());
    }
    let log = AuditLog::new(&path)?;
    for entry in log.read_recent(Some(limit))? {
        println!(
            "{:>6} {} {:<18} {:?} {}",
            entry.seq,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.event_type,
            entry.severity,
            entry.data
        );
    }
    Ok(())
}

fn set_pin_command() -> Result<()> {
    let pin = read_pin("New device PIN: ")?;
    if pin.len() < MIN_PIN_LEN {
        return Err(anyhow!("PIN too short; minimum {MIN_PIN_LEN} characters"));
    }
    if std::env::var(terminal::PIN_ENV).is_err() {
        let confirm = rpassword::prompt_password("Confirm device PIN: ")
            .map_err(|e| anyhow!("PIN prompt: {e}"))?;
        if confirm != pin {
            return Err(anyhow!("PIN confirmation mismatch"));
        }
    }
    store_pin(&pin)?;
    eprintln!("device PIN stored; keys bound to the previous enrollment need `vault reprovision`");
    Ok(())
}
