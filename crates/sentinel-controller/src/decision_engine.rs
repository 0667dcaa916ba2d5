use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::oneshot;

use sentinel_core::current_unix_timestamp_ms;

use crate::config::ControllerConfig;
use crate::controller_events::{
    ControllerEventLog, ControllerHealthSnapshot, REASON_DEAD_LISTENER_SWEEP,
    REASON_DEAD_SLOT_WITHOUT_CLEANUP, REASON_HEARTBEAT_REFRESHED, REASON_IMPLICIT_COMPLETION,
    REASON_STALE_HEARTBEAT, REASON_TERMINATION_CHECK,
};
use crate::job_record_store::{JobRecord, JobRecordStore};
use crate::lifecycle_state::InstanceLifecycleState;
use crate::process_registry::{ProcessRegistry, SlotClassification};
use crate::shutdown_sequencer::{ShutdownReason, ShutdownSequencer};

/// Outcome of one decision cycle, also persisted into the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationDecision {
    pub active_job_count: usize,
    pub idle_seconds: u64,
    pub grace_seconds: u64,
    pub terminate: bool,
}

/// Periodic reconciler between the durable job records and observed process
/// liveness. A cycle never returns an error: every failure inside it is
/// downgraded to a diagnostic, because a crashed engine would leave the
/// instance running (and billing) forever.
pub struct DecisionEngine {
    config: ControllerConfig,
    store: Arc<JobRecordStore>,
    lifecycle: Arc<InstanceLifecycleState>,
    registry: Arc<dyn ProcessRegistry>,
    events: ControllerEventLog,
    health: Mutex<ControllerHealthSnapshot>,
}

impl DecisionEngine {
    pub fn new(
        config: ControllerConfig,
        store: Arc<JobRecordStore>,
        lifecycle: Arc<InstanceLifecycleState>,
        registry: Arc<dyn ProcessRegistry>,
        events: ControllerEventLog,
    ) -> Self {
        let health = events.load_health_snapshot().unwrap_or_else(|error| {
            tracing::warn!("health snapshot unreadable, starting fresh: {error}");
            ControllerHealthSnapshot::default()
        });
        Self {
            config,
            store,
            lifecycle,
            registry,
            events,
            health: Mutex::new(health),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn health(&self) -> ControllerHealthSnapshot {
        lock_unpoisoned(&self.health).clone()
    }

    /// Runs one full decision cycle against the current process table and
    /// record set.
    pub fn evaluate_cycle(&self, now_unix_ms: u64) -> TerminationDecision {
        // Hook processes mutate the lifecycle manifest out-of-band; fold
        // their writes in before deciding anything.
        self.lifecycle.reload();
        self.registry.refresh();
        let scan = self.store.scan();
        let mut health = lock_unpoisoned(&self.health);
        health.tick_count += 1;
        for diagnostic in scan.diagnostics {
            tracing::warn!("record scan diagnostic: {diagnostic}");
            health.note(REASON_TERMINATION_CHECK, Some(diagnostic));
        }

        let survivors = if self.registry.listener_count() == 0 && !scan.records.is_empty() {
            self.sweep_dead_listeners(scan.records, &mut health);
            Vec::new()
        } else {
            let reclassified = self.reclassify_records(scan.records, now_unix_ms, &mut health);
            self.sweep_stale_heartbeats(reclassified, now_unix_ms, &mut health)
        };

        let baseline_unix_ms = self.lifecycle.activity_baseline(now_unix_ms);
        let grace = self.config.grace_period(self.lifecycle.has_run_job_ever());
        let active_job_count = survivors.len();
        let idle_seconds = now_unix_ms.saturating_sub(baseline_unix_ms) / 1_000;
        let grace_seconds = grace.as_secs();
        let decision = TerminationDecision {
            active_job_count,
            idle_seconds,
            grace_seconds,
            terminate: active_job_count == 0 && idle_seconds > grace_seconds,
        };

        health.active_job_count = decision.active_job_count;
        health.idle_seconds = decision.idle_seconds;
        health.grace_seconds = decision.grace_seconds;
        health.terminate = decision.terminate;
        health.note(REASON_TERMINATION_CHECK, None);
        if let Err(error) = self.events.persist_health_snapshot(&health) {
            tracing::warn!("health snapshot persist failed: {error}");
        }
        drop(health);

        self.events.append_event_best_effort(
            "termination_check",
            REASON_TERMINATION_CHECK,
            &format!(
                "active={} idle_s={} grace_s={} terminate={}",
                decision.active_job_count,
                decision.idle_seconds,
                decision.grace_seconds,
                decision.terminate
            ),
        );
        decision
    }

    /// No listener process anywhere means every record is orphaned: the job
    /// hooks that would clean them up can never fire again. Purging counts
    /// as no activity, so the idle clock keeps running from the last real
    /// activity.
    fn sweep_dead_listeners(
        &self,
        records: Vec<JobRecord>,
        health: &mut ControllerHealthSnapshot,
    ) {
        tracing::warn!(
            "no listener processes but {} job record(s) on disk, sweeping all",
            records.len()
        );
        for record in records {
            self.delete_record(&record, health);
        }
        health.dead_listener_sweeps_total += 1;
        health.note(REASON_DEAD_LISTENER_SWEEP, None);
        self.events.append_event_best_effort(
            "dead_listener_sweep",
            REASON_DEAD_LISTENER_SWEEP,
            "all records purged",
        );
    }

    /// Reconciles each record with its slot's observed liveness. Returns the
    /// records still believed to be running.
    fn reclassify_records(
        &self,
        records: Vec<JobRecord>,
        now_unix_ms: u64,
        health: &mut ControllerHealthSnapshot,
    ) -> Vec<JobRecord> {
        let mut survivors = Vec::with_capacity(records.len());
        for mut record in records {
            let state = self.registry.slot_state(record.runner_slot);
            match state.classify() {
                SlotClassification::Active => {
                    match self.store.refresh_heartbeat(&mut record, now_unix_ms) {
                        Ok(()) => {
                            health.heartbeats_refreshed_total += 1;
                            health.note(REASON_HEARTBEAT_REFRESHED, None);
                        }
                        Err(error) => {
                            // The in-memory heartbeat stays old, so a slot
                            // whose refreshes keep failing ages into the
                            // staleness sweep below.
                            tracing::warn!(
                                "heartbeat refresh failed: run_id={} slot={} error={error}",
                                record.run_id,
                                record.runner_slot
                            );
                            health.note(
                                REASON_TERMINATION_CHECK,
                                Some(format!(
                                    "heartbeat_refresh_failed: run_id={} slot={}",
                                    record.run_id, record.runner_slot
                                )),
                            );
                        }
                    }
                    survivors.push(record);
                }
                SlotClassification::Idle => {
                    // Listener alive, worker gone: the job finished but its
                    // completion hook never ran. Counts as activity so the
                    // grace clock restarts.
                    self.delete_record(&record, health);
                    if let Err(error) = self.lifecycle.record_activity(now_unix_ms) {
                        tracing::warn!("activity persist failed: {error}");
                    }
                    health.implicit_completions_total += 1;
                    health.note(REASON_IMPLICIT_COMPLETION, None);
                    self.events.append_event(
                        "implicit_completion",
                        REASON_IMPLICIT_COMPLETION,
                        json!({
                            "run_id": record.run_id,
                            "job_name": record.job_name,
                            "runner_slot": record.runner_slot,
                        }),
                    ).unwrap_or_else(|error| tracing::warn!("event append failed: {error}"));
                }
                SlotClassification::Dead => {
                    // Slot gone entirely. Not activity: a crashed slot must
                    // not keep the instance alive.
                    self.delete_record(&record, health);
                    health.dead_slot_purges_total += 1;
                    health.note(REASON_DEAD_SLOT_WITHOUT_CLEANUP, None);
                    self.events.append_event_best_effort(
                        "dead_slot_purge",
                        REASON_DEAD_SLOT_WITHOUT_CLEANUP,
                        &format!("run_id={} slot={}", record.run_id, record.runner_slot),
                    );
                }
            }
        }
        survivors
    }

    /// Drops survivors whose last persisted heartbeat is too old to trust.
    fn sweep_stale_heartbeats(
        &self,
        survivors: Vec<JobRecord>,
        now_unix_ms: u64,
        health: &mut ControllerHealthSnapshot,
    ) -> Vec<JobRecord> {
        let threshold_ms = self.config.stale_heartbeat_threshold().as_millis() as u64;
        let mut trusted = Vec::with_capacity(survivors.len());
        for record in survivors {
            let age_ms = record.heartbeat_age_ms(now_unix_ms);
            if age_ms <= threshold_ms {
                trusted.push(record);
                continue;
            }
            tracing::error!(
                "stale job record heartbeat, purging: run_id={} slot={} age_ms={age_ms}",
                record.run_id,
                record.runner_slot
            );
            self.delete_record(&record, health);
            health.stale_purges_total += 1;
            health.note(REASON_STALE_HEARTBEAT, None);
            self.events.append_event_best_effort(
                "stale_heartbeat_purge",
                REASON_STALE_HEARTBEAT,
                &format!(
                    "run_id={} slot={} age_ms={age_ms}",
                    record.run_id, record.runner_slot
                ),
            );
        }
        trusted
    }

    fn delete_record(&self, record: &JobRecord, health: &mut ControllerHealthSnapshot) {
        if let Err(error) = self.store.delete(&record.identity()) {
            tracing::warn!(
                "record delete failed: run_id={} slot={} error={error}",
                record.run_id,
                record.runner_slot
            );
            health.note(
                REASON_TERMINATION_CHECK,
                Some(format!(
                    "record_delete_failed: run_id={} slot={}",
                    record.run_id, record.runner_slot
                )),
            );
        }
    }
}

/// Drives the engine at the configured poll interval until the idle decision
/// fires, another component triggers the sequencer, or shutdown is requested.
pub async fn run_decision_loop(
    engine: Arc<DecisionEngine>,
    sequencer: Arc<ShutdownSequencer>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(engine.config().poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if sequencer.is_triggered() {
                    tracing::info!("shutdown already in progress, decision loop exiting");
                    break;
                }
                let decision = engine.evaluate_cycle(current_unix_timestamp_ms());
                tracing::debug!(
                    "decision cycle: active={} idle_s={} grace_s={} terminate={}",
                    decision.active_job_count,
                    decision.idle_seconds,
                    decision.grace_seconds,
                    decision.terminate
                );
                if decision.terminate {
                    sequencer.run(ShutdownReason::IdleTimeout).await;
                    break;
                }
            }
            _ = &mut shutdown_rx => {
                tracing::info!("decision loop shutdown requested");
                break;
            }
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
