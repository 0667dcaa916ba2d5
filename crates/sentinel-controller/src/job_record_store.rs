use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sentinel_core::write_text_atomic;

pub const JOB_RECORD_SCHEMA_VERSION: u32 = 1;
const JOB_RECORD_DIR: &str = "jobs";
const IDENTITY_DIGEST_HEX_LEN: usize = 10;

fn job_record_schema_version() -> u32 {
    JOB_RECORD_SCHEMA_VERSION
}

/// Lifecycle status of a tracked job. Only `running` is ever persisted;
/// completion deletes the record instead of transitioning it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
        }
    }
}

/// Unique identity of an in-flight job: one record per
/// `(run_id, job_name, runner_slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobIdentity {
    pub run_id: String,
    pub job_name: String,
    pub runner_slot: u32,
}

impl JobIdentity {
    pub fn new(run_id: impl Into<String>, job_name: impl Into<String>, runner_slot: u32) -> Self {
        Self {
            run_id: run_id.into(),
            job_name: job_name.into(),
            runner_slot,
        }
    }

    /// Filesystem-safe record key. Job names are free-form, so the key keeps
    /// a sanitized run id and slot for operator readability and leans on a
    /// digest prefix for uniqueness.
    pub fn record_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.run_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.job_name.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.runner_slot.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut digest_hex = String::with_capacity(IDENTITY_DIGEST_HEX_LEN);
        for byte in digest.iter() {
            if digest_hex.len() >= IDENTITY_DIGEST_HEX_LEN {
                break;
            }
            digest_hex.push_str(&format!("{byte:02x}"));
        }
        digest_hex.truncate(IDENTITY_DIGEST_HEX_LEN);
        format!(
            "{}-{}-{digest_hex}",
            sanitize_component(&self.run_id),
            self.runner_slot
        )
    }
}

/// Durable record for one in-flight job. The heartbeat is an explicit field
/// rather than file metadata so staleness detection keeps working when
/// refresh writes start failing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    #[serde(default = "job_record_schema_version")]
    pub schema_version: u32,
    pub run_id: String,
    pub job_name: String,
    pub runner_slot: u32,
    pub status: JobStatus,
    pub heartbeat_unix_ms: u64,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

impl JobRecord {
    pub fn identity(&self) -> JobIdentity {
        JobIdentity::new(self.run_id.clone(), self.job_name.clone(), self.runner_slot)
    }

    pub fn heartbeat_age_ms(&self, now_unix_ms: u64) -> u64 {
        now_unix_ms.saturating_sub(self.heartbeat_unix_ms)
    }
}

/// Result of a full record scan: decodable records plus diagnostics for
/// anything that had to be discarded along the way.
#[derive(Debug, Default)]
pub struct JobRecordScan {
    pub records: Vec<JobRecord>,
    pub diagnostics: Vec<String>,
}

/// Durable key→record store for in-flight jobs, one JSON manifest per
/// identity. Mutations serialize through an internal lock; writes are
/// temp-file + rename so concurrent readers never observe partial records.
#[derive(Debug)]
pub struct JobRecordStore {
    state_dir: PathBuf,
    mutate_lock: Mutex<()>,
}

impl JobRecordStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let records_dir = state_dir.join(JOB_RECORD_DIR);
        std::fs::create_dir_all(&records_dir)
            .with_context(|| format!("failed to create {}", records_dir.display()))?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            mutate_lock: Mutex::new(()),
        })
    }

    pub fn records_dir(&self) -> PathBuf {
        self.state_dir.join(JOB_RECORD_DIR)
    }

    pub fn record_path(&self, identity: &JobIdentity) -> PathBuf {
        self.records_dir()
            .join(format!("{}.json", identity.record_key()))
    }

    /// Creates or overwrites the record for this identity. Duplicate starts
    /// for the same identity are an overwrite, not an error.
    pub fn upsert(&self, identity: &JobIdentity, now_unix_ms: u64) -> Result<JobRecord> {
        let _guard = lock_unpoisoned(&self.mutate_lock);
        let record = JobRecord {
            schema_version: JOB_RECORD_SCHEMA_VERSION,
            run_id: identity.run_id.clone(),
            job_name: identity.job_name.clone(),
            runner_slot: identity.runner_slot,
            status: JobStatus::Running,
            heartbeat_unix_ms: now_unix_ms,
            created_unix_ms: now_unix_ms,
            updated_unix_ms: now_unix_ms,
        };
        self.persist(&record)?;
        Ok(record)
    }

    /// Re-persists the record with a fresh heartbeat. On write failure the
    /// in-memory record keeps its old heartbeat, so the staleness sweep still
    /// sees the true last persisted beat.
    pub fn refresh_heartbeat(&self, record: &mut JobRecord, now_unix_ms: u64) -> Result<()> {
        let _guard = lock_unpoisoned(&self.mutate_lock);
        let mut refreshed = record.clone();
        refreshed.heartbeat_unix_ms = now_unix_ms;
        refreshed.updated_unix_ms = now_unix_ms;
        self.persist(&refreshed)?;
        *record = refreshed;
        Ok(())
    }

    /// Deletes the record if present; absent is a no-op (completion can race
    /// independent reclassification).
    pub fn delete(&self, identity: &JobIdentity) -> Result<bool> {
        let _guard = lock_unpoisoned(&self.mutate_lock);
        let path = self.record_path(identity);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(true)
    }

    /// Loads every decodable record. Undecodable manifests are removed and
    /// reported as diagnostics: a record that cannot be read cannot be
    /// trusted to keep the instance alive.
    pub fn scan(&self) -> JobRecordScan {
        let mut scan = JobRecordScan::default();
        let dir = self.records_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) => {
                scan.diagnostics
                    .push(format!("records_dir_unreadable: path={} error={error}", dir.display()));
                return scan;
            }
        };
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_json = path
                .extension()
                .and_then(|value| value.to_str())
                .map(|value| value.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if path.is_file() && is_json {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(error) => {
                    scan.diagnostics.push(format!(
                        "record_unreadable: path={} error={error}",
                        path.display()
                    ));
                    continue;
                }
            };
            match serde_json::from_str::<JobRecord>(&raw) {
                Ok(record) => scan.records.push(record),
                Err(error) => {
                    scan.diagnostics.push(format!(
                        "record_undecodable_removed: path={} error={error}",
                        path.display()
                    ));
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        scan
    }

    fn persist(&self, record: &JobRecord) -> Result<()> {
        let path = self.record_path(&record.identity());
        let mut payload =
            serde_json::to_string_pretty(record).context("failed to encode job record")?;
        payload.push('\n');
        write_text_atomic(&path, &payload)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn sanitize_component(raw: &str) -> String {
    let mut sanitized: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.is_empty() {
        sanitized.push_str("unknown");
    }
    sanitized.truncate(64);
    sanitized
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
