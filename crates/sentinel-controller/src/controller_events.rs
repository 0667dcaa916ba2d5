use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use sentinel_core::{append_line, current_unix_timestamp_ms, write_text_atomic};

pub(crate) const CONTROLLER_STATE_SCHEMA_VERSION: u32 = 1;
const CONTROLLER_STATE_FILE: &str = "controller-state.json";
const CONTROLLER_EVENT_LOG_FILE: &str = "events.jsonl";
const RECENT_REASON_CODE_CAP: usize = 16;
const RECENT_DIAGNOSTICS_CAP: usize = 24;

pub const REASON_JOB_STARTED: &str = "job_started";
pub const REASON_JOB_COMPLETED: &str = "job_completed";
pub const REASON_HEARTBEAT_REFRESHED: &str = "heartbeat_refreshed";
pub const REASON_IMPLICIT_COMPLETION: &str = "implicit_completion";
pub const REASON_DEAD_SLOT_WITHOUT_CLEANUP: &str = "dead_slot_without_cleanup";
pub const REASON_STALE_HEARTBEAT: &str = "stale_heartbeat";
pub const REASON_DEAD_LISTENER_SWEEP: &str = "dead_listener_sweep";
pub const REASON_TERMINATION_CHECK: &str = "termination_check";
pub const REASON_SLOT_REGISTERED: &str = "slot_registered";
pub const REASON_SLOT_REGISTRATION_FAILED: &str = "slot_registration_failed";
pub const REASON_PARTIAL_RUNNER_FAILURE: &str = "partial_runner_failure";
pub const REASON_ALL_RUNNERS_FAILED: &str = "all_runners_failed";
pub const REASON_SHUTDOWN_STEP_FAILED: &str = "shutdown_step_failed";
pub const REASON_SHUTDOWN_STARTED: &str = "shutdown_started";
pub const REASON_SHUTDOWN_COMPLETED: &str = "shutdown_completed";

fn controller_state_schema_version() -> u32 {
    CONTROLLER_STATE_SCHEMA_VERSION
}

/// One line of the append-only controller event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerEventRecord {
    pub timestamp_unix_ms: u64,
    pub event: String,
    pub reason_code: String,
    pub detail: serde_json::Value,
}

/// Durable counters and last-decision fields persisted for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerHealthSnapshot {
    #[serde(default = "controller_state_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub tick_count: u64,
    #[serde(default)]
    pub active_job_count: usize,
    #[serde(default)]
    pub idle_seconds: u64,
    #[serde(default)]
    pub grace_seconds: u64,
    #[serde(default)]
    pub terminate: bool,
    #[serde(default)]
    pub heartbeats_refreshed_total: u64,
    #[serde(default)]
    pub implicit_completions_total: u64,
    #[serde(default)]
    pub dead_slot_purges_total: u64,
    #[serde(default)]
    pub stale_purges_total: u64,
    #[serde(default)]
    pub dead_listener_sweeps_total: u64,
    #[serde(default)]
    pub last_reason_code: String,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

impl Default for ControllerHealthSnapshot {
    fn default() -> Self {
        Self {
            schema_version: CONTROLLER_STATE_SCHEMA_VERSION,
            updated_unix_ms: current_unix_timestamp_ms(),
            tick_count: 0,
            active_job_count: 0,
            idle_seconds: 0,
            grace_seconds: 0,
            terminate: false,
            heartbeats_refreshed_total: 0,
            implicit_completions_total: 0,
            dead_slot_purges_total: 0,
            stale_purges_total: 0,
            dead_listener_sweeps_total: 0,
            last_reason_code: String::new(),
            reason_codes: Vec::new(),
            diagnostics: Vec::new(),
        }
    }
}

impl ControllerHealthSnapshot {
    /// Records a reason code plus optional diagnostic line, advancing the
    /// bounded recent-history rings.
    pub fn note(&mut self, reason_code: &str, diagnostic: Option<String>) {
        self.updated_unix_ms = current_unix_timestamp_ms();
        self.last_reason_code = reason_code.to_string();
        push_recent_reason_code(&mut self.reason_codes, reason_code, RECENT_REASON_CODE_CAP);
        if let Some(line) = diagnostic {
            push_recent_line(&mut self.diagnostics, line, RECENT_DIAGNOSTICS_CAP);
        }
    }
}

/// Append-only event sink rooted at the controller state directory.
#[derive(Debug, Clone)]
pub struct ControllerEventLog {
    state_dir: PathBuf,
}

impl ControllerEventLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join(CONTROLLER_EVENT_LOG_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(CONTROLLER_STATE_FILE)
    }

    /// Appends one event line. Errors propagate so hook entry points can
    /// treat persistence failure as fatal; loop callers downgrade to a log.
    pub fn append_event(
        &self,
        event: &str,
        reason_code: &str,
        detail: serde_json::Value,
    ) -> Result<()> {
        let record = ControllerEventRecord {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            event: event.to_string(),
            reason_code: reason_code.to_string(),
            detail,
        };
        let line = serde_json::to_string(&record).context("failed to encode event record")?;
        append_line(&self.events_path(), &line)
    }

    /// Best-effort variant for poll-loop call sites that must never crash.
    pub fn append_event_best_effort(&self, event: &str, reason_code: &str, detail: &str) {
        if let Err(error) = self.append_event(event, reason_code, json!({ "detail": detail })) {
            tracing::warn!(
                "controller event append failed: path={} error={error}",
                self.events_path().display()
            );
        }
    }

    pub fn persist_health_snapshot(&self, snapshot: &ControllerHealthSnapshot) -> Result<()> {
        let path = self.state_path();
        let mut payload = serde_json::to_string_pretty(snapshot)
            .context("failed to encode controller health snapshot")?;
        payload.push('\n');
        write_text_atomic(&path, &payload)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load_health_snapshot(&self) -> Result<ControllerHealthSnapshot> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(ControllerHealthSnapshot::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(ControllerHealthSnapshot::default());
        }
        serde_json::from_str::<ControllerHealthSnapshot>(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

fn push_recent_reason_code(reason_codes: &mut Vec<String>, reason_code: &str, cap: usize) {
    if reason_codes.iter().any(|existing| existing == reason_code) {
        reason_codes.retain(|existing| existing != reason_code);
    }
    reason_codes.push(reason_code.to_string());
    while reason_codes.len() > cap {
        reason_codes.remove(0);
    }
}

fn push_recent_line(lines: &mut Vec<String>, line: String, cap: usize) {
    lines.push(line);
    while lines.len() > cap {
        lines.remove(0);
    }
}
