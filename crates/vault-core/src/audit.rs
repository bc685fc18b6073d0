//! Append-only, hash-chained journal of security events.
//!
//! One JSON object per line. Each entry carries the hash of its predecessor
//! so that editing, removing or reordering a line breaks [`AuditLog::verify`].
//! Entries name records by identifier only; payloads never reach the journal.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const CHAIN_START: &str = "CHAIN_START";

pub mod events {
    pub const KEY_PROVISIONED: &str = "KEY_PROVISIONED";
    pub const KEY_INVALIDATED: &str = "KEY_INVALIDATED";
    pub const KEY_REPROVISIONED: &str = "KEY_REPROVISIONED";
    pub const UNLOCKED: &str = "UNLOCKED";
    pub const UNLOCK_FAILED: &str = "UNLOCK_FAILED";
    pub const LOCKED: &str = "LOCKED";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const RECORD_WRITTEN: &str = "RECORD_WRITTEN";
    pub const RECORD_DELETED: &str = "RECORD_DELETED";
    pub const INTEGRITY_FAILURE: &str = "INTEGRITY_FAILURE";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: AuditSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    fn expected_hash(&self) -> String {
        chain_hash(
            self.seq,
            &self.timestamp,
            &self.event_type,
            self.severity,
            &self.data,
            &self.prev_hash,
        )
    }
}

fn chain_hash(
    seq: u64,
    timestamp: &DateTime<Utc>,
    event_type: &str,
    severity: AuditSeverity,
    data: &serde_json::Value,
    prev_hash: &str,
) -> String {
    let body = json!({
        "seq": seq,
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        "event_type": event_type,
        "severity": severity,
        "data": data,
        "prev_hash": prev_hash,
    });
    let mut hasher = Sha256::new();
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of walking the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub entries: u64,
    /// Line number (1-based) of the first entry that does not link up.
    pub first_break: Option<u64>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

#[derive(Debug)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
}

pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<ChainState>,
}

impl AuditLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(ChainState {
                last_seq,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for entry in Self::read_all(path)? {
            last_seq = entry.seq;
            last_hash = entry.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn read_all(path: &Path) -> Result<Vec<AuditEntry>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    pub fn append(
        &self,
        event_type: &str,
        severity: AuditSeverity,
        data: serde_json::Value,
    ) -> Result<AuditEntry> {
        let mut state = self.inner.lock();
        let seq = state.last_seq + 1;
        let timestamp = Utc::now();
        let hash = chain_hash(seq, &timestamp, event_type, severity, &data, &state.last_hash);
        let entry = AuditEntry {
            seq,
            timestamp,
            event_type: event_type.to_string(),
            severity,
            data,
            prev_hash: state.last_hash.clone(),
            hash,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.sync_data()?;
        state.last_seq = seq;
        state.last_hash = entry.hash.clone();
        Ok(entry)
    }

    /// Most recent entries first.
    pub fn read_recent(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let mut entries = Self::read_all(&self.path)?;
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub fn verify(&self) -> Result<ChainReport> {
        verify_file(&self.path)
    }
}

/// Walk a journal without opening it for writing.
pub fn verify_file(path: &Path) -> Result<ChainReport> {
    let mut report = ChainReport {
        entries: 0,
        first_break: None,
    };
    if !path.exists() {
        return Ok(report);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut prev_hash = CHAIN_START.to_string();
    let mut prev_seq = 0u64;
    let mut line_no = 0u64;
    for line in reader.lines() {
        let line = line?;
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let linked = match serde_json::from_str::<AuditEntry>(&line) {
            Ok(entry) => {
                let ok = entry.prev_hash == prev_hash
                    && entry.seq == prev_seq + 1
                    && entry.hash == entry.expected_hash();
                prev_hash = entry.hash;
                prev_seq = entry.seq;
                ok
            }
            Err(_) => false,
        };
        report.entries += 1;
        if !linked && report.first_break.is_none() {
            report.first_break = Some(line_no);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn filled_log(dir: &Path, count: usize) -> AuditLog {
        let log = AuditLog::new(dir.join("audit.log")).unwrap();
        for i in 0..count {
            let entry = log
                .append(events::RECORD_WRITTEN, AuditSeverity::Info, json!({ "id": format!("r{i}") }))
                .unwrap();
            assert_eq!(entry.seq as usize, i + 1);
        }
        log
    }

    #[test]
    fn chain_verifies_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let log = filled_log(dir.path(), 5);
        drop(log);

        let log = AuditLog::new(dir.path().join("audit.log")).unwrap();
        let next = log.append(events::LOCKED, AuditSeverity::Info, json!({})).unwrap();
        assert_eq!(next.seq, 6);

        let report = log.verify().unwrap();
        assert_eq!(report.entries, 6);
        assert!(report.is_intact());
    }

    #[test]
    fn edited_line_breaks_the_chain() {
        let dir = tempdir().unwrap();
        let log = filled_log(dir.path(), 4);
        let contents = fs::read_to_string(log.path()).unwrap();
        fs::write(log.path(), contents.replacen("\"r2\"", "\"r9\"", 1)).unwrap();
        assert_eq!(log.verify().unwrap().first_break, Some(3));
    }

    #[test]
    fn removed_line_breaks_the_chain() {
        let dir = tempdir().unwrap();
        let log = filled_log(dir.path(), 4);
        let contents = fs::read_to_string(log.path()).unwrap();
        let kept: Vec<&str> = contents.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        fs::write(log.path(), kept.join("\n") + "\n").unwrap();
        assert_eq!(log.verify().unwrap().first_break, Some(2));
    }

    #[test]
    fn read_recent_is_newest_first() {
        let dir = tempdir().unwrap();
        let log = filled_log(dir.path(), 3);
        let recent = log.read_recent(Some(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].seq, 3);
        assert_eq!(recent[1].seq, 2);
    }

    #[test]
    fn missing_journal_is_empty_and_intact() {
        let dir = tempdir().unwrap();
        let report = verify_file(&dir.path().join("audit.log")).unwrap();
        assert_eq!(report.entries, 0);
        assert!(report.is_intact());
    }
}
