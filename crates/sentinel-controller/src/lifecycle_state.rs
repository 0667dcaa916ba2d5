use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sentinel_core::write_text_atomic;

pub(crate) const LIFECYCLE_STATE_SCHEMA_VERSION: u32 = 1;
const LIFECYCLE_STATE_FILE: &str = "lifecycle-state.json";

fn lifecycle_state_schema_version() -> u32 {
    LIFECYCLE_STATE_SCHEMA_VERSION
}

/// Point-in-time copy of the instance-wide lifecycle flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub last_activity_unix_ms: Option<u64>,
    pub has_run_job_ever: bool,
    pub registered: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedLifecycle {
    #[serde(default = "lifecycle_state_schema_version")]
    schema_version: u32,
    #[serde(default)]
    last_activity_unix_ms: Option<u64>,
    #[serde(default)]
    has_run_job_ever: bool,
    #[serde(default)]
    registered: bool,
}

/// Instance-wide lifecycle flags shared between the job tracker, the
/// decision engine, and the provisioner. The job hooks run as short-lived
/// processes separate from the controller daemon, so the state is backed by
/// a durable manifest in the shared state directory: hooks write it, the
/// engine re-reads it every poll. Every field is monotonic (the activity
/// timestamp only moves forward, the booleans only flip to true), so
/// merge-then-write converges under any interleaving of writers.
#[derive(Debug, Default)]
pub struct InstanceLifecycleState {
    inner: Mutex<LifecycleSnapshot>,
    persist_path: Option<PathBuf>,
}

impl InstanceLifecycleState {
    /// In-memory state with no durable backing, for single-process use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the durable state rooted at the controller state directory,
    /// seeding from the manifest when one exists.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let state = Self {
            inner: Mutex::new(LifecycleSnapshot::default()),
            persist_path: Some(state_dir.join(LIFECYCLE_STATE_FILE)),
        };
        {
            let mut inner = lock_unpoisoned(&state.inner);
            state.merge_from_disk(&mut inner)?;
        }
        Ok(state)
    }

    /// Folds the latest on-disk state into memory, so writes from the hook
    /// processes become visible. Read failures keep the in-memory view.
    pub fn reload(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        if let Err(error) = self.merge_from_disk(&mut inner) {
            tracing::warn!("lifecycle state reload failed: {error}");
        }
    }

    /// Advances the activity timestamp; earlier timestamps are ignored.
    pub fn record_activity(&self, now_unix_ms: u64) -> Result<()> {
        let mut inner = lock_unpoisoned(&self.inner);
        self.merge_best_effort(&mut inner);
        advance_activity(&mut inner, now_unix_ms);
        self.persist(&inner)
    }

    /// Records a job start: activity plus the permanent first-job marker.
    pub fn mark_job_started(&self, now_unix_ms: u64) -> Result<()> {
        let mut inner = lock_unpoisoned(&self.inner);
        self.merge_best_effort(&mut inner);
        inner.has_run_job_ever = true;
        advance_activity(&mut inner, now_unix_ms);
        self.persist(&inner)
    }

    pub fn mark_registered(&self) -> Result<()> {
        let mut inner = lock_unpoisoned(&self.inner);
        self.merge_best_effort(&mut inner);
        inner.registered = true;
        self.persist(&inner)
    }

    pub fn is_registered(&self) -> bool {
        lock_unpoisoned(&self.inner).registered
    }

    pub fn has_run_job_ever(&self) -> bool {
        lock_unpoisoned(&self.inner).has_run_job_ever
    }

    /// Returns the activity timestamp, defaulting it to `now` if never set.
    /// The default is persisted best-effort so every reader measures idle
    /// time from the same baseline.
    pub fn activity_baseline(&self, now_unix_ms: u64) -> u64 {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.last_activity_unix_ms {
            Some(value) => value,
            None => {
                inner.last_activity_unix_ms = Some(now_unix_ms);
                if let Err(error) = self.persist(&inner) {
                    tracing::warn!("lifecycle baseline persist failed: {error}");
                }
                now_unix_ms
            }
        }
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        *lock_unpoisoned(&self.inner)
    }

    fn merge_best_effort(&self, inner: &mut LifecycleSnapshot) {
        if let Err(error) = self.merge_from_disk(inner) {
            tracing::warn!("lifecycle state merge failed: {error}");
        }
    }

    fn merge_from_disk(&self, inner: &mut LifecycleSnapshot) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(());
        }
        let disk = serde_json::from_str::<PersistedLifecycle>(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if let Some(value) = disk.last_activity_unix_ms {
            advance_activity(inner, value);
        }
        inner.has_run_job_ever |= disk.has_run_job_ever;
        inner.registered |= disk.registered;
        Ok(())
    }

    fn persist(&self, inner: &LifecycleSnapshot) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let persisted = PersistedLifecycle {
            schema_version: LIFECYCLE_STATE_SCHEMA_VERSION,
            last_activity_unix_ms: inner.last_activity_unix_ms,
            has_run_job_ever: inner.has_run_job_ever,
            registered: inner.registered,
        };
        let mut payload = serde_json::to_string_pretty(&persisted)
            .context("failed to encode lifecycle state")?;
        payload.push('\n');
        write_text_atomic(path, &payload)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn advance_activity(inner: &mut LifecycleSnapshot, now_unix_ms: u64) {
    inner.last_activity_unix_ms = Some(
        inner
            .last_activity_unix_ms
            .map_or(now_unix_ms, |current| current.max(now_unix_ms)),
    );
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
