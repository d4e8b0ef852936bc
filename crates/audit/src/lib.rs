//! bouncer_audit
//!
//! Append-only, hash-chained audit log of `AuditEntry` records. Every
//! admission decision and every approver action is recorded here,
//! regardless of outcome -- including rejections and internal failures
//! (§4.14: internal errors are audited but never leaked to the caller).
//!
//! The chain lets an operator detect tampering: each record's hash covers
//! the previous record's hash plus the new entry, so truncating or editing
//! history breaks verification.

use bouncer_common::sha256_canonical_json;
use bouncer_model::AuditEntry;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] bouncer_common::CanonError),
    #[error("hash mismatch at line {line}: expected {expected}, got {got}")]
    HashMismatch {
        line: usize,
        expected: String,
        got: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub prev_hash: String,
    pub hash: String,
    pub entry: AuditEntry,
}

#[derive(Debug, Clone, Serialize)]
struct HashPayload<'a> {
    prev_hash: &'a str,
    entry: &'a AuditEntry,
}

pub fn genesis_hash() -> String {
    "sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string()
}

pub fn compute_record_hash(prev_hash: &str, entry: &AuditEntry) -> Result<String, AuditError> {
    let payload = HashPayload { prev_hash, entry };
    Ok(sha256_canonical_json(&payload)?)
}

/// Interface the rest of the gateway depends on. A pipeline or dispatcher
/// never reaches for a file directly -- it records through this trait, so
/// tests can substitute an in-memory sink.
pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError>;
}

/// JSONL file-backed implementation with hash chaining.
pub struct FileAuditLog {
    inner: Mutex<FileAuditLogInner>,
}

struct FileAuditLogInner {
    file: File,
    last_hash: String,
}

impl FileAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::debug!(path = %path.display(), "opened audit log");
        Ok(Self {
            inner: Mutex::new(FileAuditLogInner {
                file,
                last_hash: genesis_hash(),
            }),
        })
    }

    pub fn with_last_hash(self, last_hash: String) -> Self {
        self.inner.lock().unwrap().last_hash = last_hash;
        self
    }
}

impl AuditLog for FileAuditLog {
    fn record(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut guard = self.inner.lock().unwrap();
        let prev_hash = guard.last_hash.clone();
        let hash = compute_record_hash(&prev_hash, &entry)?;
        let record = AuditRecord {
            prev_hash,
            hash: hash.clone(),
            entry,
        };
        let line = serde_json::to_string(&record)?;
        guard.file.write_all(line.as_bytes())?;
        guard.file.write_all(b"\n")?;
        guard.file.flush()?;
        guard.last_hash = hash;
        Ok(record)
    }
}

/// In-memory sink for tests and for short-lived processes that don't need
/// durability across restarts.
#[derive(Default)]
pub struct MemoryAuditLog {
    inner: Mutex<MemoryAuditLogInner>,
}

#[derive(Default)]
struct MemoryAuditLogInner {
    last_hash: Option<String>,
    records: Vec<AuditRecord>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().unwrap().records.clone()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut guard = self.inner.lock().unwrap();
        let prev_hash = guard.last_hash.clone().unwrap_or_else(genesis_hash);
        let hash = compute_record_hash(&prev_hash, &entry)?;
        let record = AuditRecord {
            prev_hash,
            hash: hash.clone(),
            entry,
        };
        guard.records.push(record.clone());
        guard.last_hash = Some(hash);
        Ok(record)
    }
}

pub fn verify_log(path: impl AsRef<Path>) -> Result<String, AuditError> {
    let f = File::open(path)?;
    let reader = BufReader::new(f);
    let mut expected_prev = genesis_hash();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(&line)?;
        if rec.prev_hash != expected_prev {
            tracing::warn!(line = line_no, "audit chain broken: prev_hash mismatch");
            return Err(AuditError::HashMismatch {
                line: line_no,
                expected: expected_prev,
                got: rec.prev_hash,
            });
        }
        let computed = compute_record_hash(&rec.prev_hash, &rec.entry)?;
        if computed != rec.hash {
            tracing::warn!(line = line_no, "audit chain broken: record hash mismatch");
            return Err(AuditError::HashMismatch {
                line: line_no,
                expected: computed,
                got: rec.hash,
            });
        }
        expected_prev = rec.hash;
    }

    Ok(expected_prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bouncer_common::now;

    fn sample_entry() -> AuditEntry {
        AuditEntry {
            request_id: Some("r1".into()),
            kind: None,
            decision_type: None,
            source: "bot-a".into(),
            trust_scope: Some("bot-a".into()),
            account_id: Some("acct".into()),
            score: Some(10),
            reasons: vec!["ok".into()],
            latency_ms: 5,
            at: now(),
        }
    }

    #[test]
    fn memory_log_chains_hashes() {
        let log = MemoryAuditLog::new();
        log.record(sample_entry()).unwrap();
        log.record(sample_entry()).unwrap();
        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].prev_hash, records[0].hash);
    }

    #[test]
    fn file_log_round_trips_and_verifies() {
        let tmp = std::env::temp_dir().join(format!(
            "bouncer_audit_test_{}.jsonl",
            bouncer_common::opaque_id("t", 8)
        ));
        let _ = std::fs::remove_file(&tmp);
        let log = FileAuditLog::open(&tmp).unwrap();
        log.record(sample_entry()).unwrap();
        log.record(sample_entry()).unwrap();
        let last = verify_log(&tmp).unwrap();
        assert!(last.starts_with("sha256:"));
        std::fs::remove_file(&tmp).ok();
    }
}
