use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use sentinel_core::current_unix_timestamp_ms;

use crate::controller_events::{ControllerEventLog, REASON_JOB_COMPLETED, REASON_JOB_STARTED};
use crate::job_record_store::{JobIdentity, JobRecord, JobRecordStore};
use crate::lifecycle_state::InstanceLifecycleState;

/// Entry points invoked by the runner agent's job hooks. Fire-and-forget
/// from the agent's point of view: the hook process exit code is the only
/// signal, so persistence failures propagate to the caller and nowhere else.
#[derive(Debug, Clone)]
pub struct JobTracker {
    store: Arc<JobRecordStore>,
    lifecycle: Arc<InstanceLifecycleState>,
    events: ControllerEventLog,
}

impl JobTracker {
    pub fn new(
        store: Arc<JobRecordStore>,
        lifecycle: Arc<InstanceLifecycleState>,
        events: ControllerEventLog,
    ) -> Self {
        Self {
            store,
            lifecycle,
            events,
        }
    }

    /// Records a job start: upserts the record (duplicate identity is an
    /// overwrite) and advances the activity clock.
    pub fn on_job_started(&self, identity: &JobIdentity) -> Result<JobRecord> {
        let now = current_unix_timestamp_ms();
        let record = self.store.upsert(identity, now)?;
        self.lifecycle.mark_job_started(now)?;
        self.events.append_event(
            "job_started",
            REASON_JOB_STARTED,
            json!({
                "run_id": identity.run_id,
                "job_name": identity.job_name,
                "runner_slot": identity.runner_slot,
            }),
        )?;
        Ok(record)
    }

    /// Records a job completion: deletes the record if still present (the
    /// decision engine may have already reclassified it away) and advances
    /// the activity clock either way.
    pub fn on_job_completed(&self, identity: &JobIdentity) -> Result<bool> {
        let now = current_unix_timestamp_ms();
        let removed = self.store.delete(identity)?;
        self.lifecycle.record_activity(now)?;
        self.events.append_event(
            "job_completed",
            REASON_JOB_COMPLETED,
            json!({
                "run_id": identity.run_id,
                "job_name": identity.job_name,
                "runner_slot": identity.runner_slot,
                "record_present": removed,
            }),
        )?;
        Ok(removed)
    }
}
