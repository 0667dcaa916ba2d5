use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::controller_events::{
    ControllerEventLog, REASON_ALL_RUNNERS_FAILED, REASON_PARTIAL_RUNNER_FAILURE,
    REASON_SLOT_REGISTERED, REASON_SLOT_REGISTRATION_FAILED,
};
use crate::lifecycle_state::InstanceLifecycleState;

/// Everything one runner slot needs to come up: its index, a slot-specific
/// registration token, and the labels it advertises.
#[derive(Debug, Clone)]
pub struct RunnerSlotSpec {
    pub index: u32,
    pub token: String,
    pub labels: Vec<String>,
}

/// Brings one runner slot from nothing to registered-and-polling. One
/// implementation drives real shell tooling; tests substitute their own.
#[async_trait]
pub trait SlotSetup: Send + Sync {
    async fn provision(&self, spec: RunnerSlotSpec) -> Result<()>;
}

/// Aggregate result of provisioning all requested slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub status: ProvisionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStatus {
    FullSuccess,
    /// Some slots failed; the instance continues with reduced capacity.
    Degraded,
    /// Every slot failed; the caller must tear the instance down.
    AllFailed,
}

/// Provisions all slots in parallel. Slot failures are isolated: one bad
/// slot never aborts its siblings. Every spawned slot reports exactly one
/// result, and a slot whose task dies without reporting counts as failed,
/// so `succeeded + failed` always equals the requested slot count.
pub async fn provision_slots(
    setup: Arc<dyn SlotSetup>,
    specs: Vec<RunnerSlotSpec>,
    lifecycle: Arc<InstanceLifecycleState>,
    events: &ControllerEventLog,
) -> ProvisionOutcome {
    let requested = specs.len();
    let (report_tx, mut report_rx) = mpsc::unbounded_channel::<(u32, Result<()>)>();
    for spec in specs {
        let setup = Arc::clone(&setup);
        let report_tx = report_tx.clone();
        tokio::spawn(async move {
            let index = spec.index;
            let result = setup.provision(spec).await;
            let _ = report_tx.send((index, result));
        });
    }
    drop(report_tx);

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    while let Some((index, result)) = report_rx.recv().await {
        match result {
            Ok(()) => {
                succeeded += 1;
                if succeeded == 1 {
                    // The in-memory flag is what the watchdog checks; a
                    // failed manifest write must not fail the slot.
                    if let Err(error) = lifecycle.mark_registered() {
                        tracing::warn!("registered flag persist failed: {error}");
                    }
                }
                tracing::info!("runner slot registered: slot={index}");
                if let Err(error) = events.append_event(
                    "slot_registered",
                    REASON_SLOT_REGISTERED,
                    json!({ "slot": index }),
                ) {
                    tracing::warn!("event append failed: {error}");
                }
            }
            Err(error) => {
                failed += 1;
                tracing::error!("runner slot provisioning failed: slot={index} error={error:#}");
                events.append_event_best_effort(
                    "slot_registration_failed",
                    REASON_SLOT_REGISTRATION_FAILED,
                    &format!("slot={index} error={error:#}"),
                );
            }
        }
    }
    // Tasks that died without reporting (panic, abort) count as failures.
    failed += requested.saturating_sub(succeeded + failed);

    let status = if requested > 0 && succeeded == 0 {
        events.append_event_best_effort(
            "all_runners_failed",
            REASON_ALL_RUNNERS_FAILED,
            &format!("requested={requested}"),
        );
        ProvisionStatus::AllFailed
    } else if failed > 0 {
        events.append_event_best_effort(
            "partial_runner_failure",
            REASON_PARTIAL_RUNNER_FAILURE,
            &format!("succeeded={succeeded} failed={failed}"),
        );
        ProvisionStatus::Degraded
    } else {
        ProvisionStatus::FullSuccess
    };
    ProvisionOutcome {
        succeeded,
        failed,
        status,
    }
}

/// Shell-tooling slot setup: unpacks the runner agent archive into a
/// slot-scoped directory, configures it against the coordinator, and leaves
/// the agent polling in the background.
#[derive(Debug, Clone)]
pub struct ShellSlotSetup {
    /// Pre-downloaded runner agent archive (tar.gz).
    pub agent_archive: PathBuf,
    /// Parent directory of the per-slot working directories.
    pub slots_root: PathBuf,
    /// Coordinator URL the agent registers against.
    pub coordinator_url: String,
}

impl ShellSlotSetup {
    pub fn slot_dir(&self, index: u32) -> PathBuf {
        self.slots_root.join(format!("runner-{index}"))
    }

    async fn run_in_dir(dir: &PathBuf, program: &str, args: &[String]) -> Result<()> {
        let status = tokio::process::Command::new(program)
            .args(args)
            .current_dir(dir)
            .status()
            .await
            .with_context(|| format!("failed to spawn {program}"))?;
        if !status.success() {
            bail!("{program} exited with {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl SlotSetup for ShellSlotSetup {
    async fn provision(&self, spec: RunnerSlotSpec) -> Result<()> {
        if !self.agent_archive.is_file() {
            bail!(
                "runner agent archive missing: {}",
                self.agent_archive.display()
            );
        }
        let dir = self.slot_dir(spec.index);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        Self::run_in_dir(
            &dir,
            "tar",
            &[
                "-xzf".to_string(),
                self.agent_archive.display().to_string(),
                "-C".to_string(),
                dir.display().to_string(),
            ],
        )
        .await
        .context("agent archive extraction failed")?;

        // Dependency bootstrap is best-effort: images that pre-bake the
        // dependencies ship without the script.
        let dependency_script = dir.join("bin").join("installdependencies.sh");
        if dependency_script.is_file() {
            if let Err(error) =
                Self::run_in_dir(&dir, "sh", &[dependency_script.display().to_string()]).await
            {
                tracing::warn!(
                    "dependency bootstrap failed, continuing: slot={} error={error}",
                    spec.index
                );
            }
        }

        Self::run_in_dir(
            &dir,
            "./config.sh",
            &[
                "--unattended".to_string(),
                "--ephemeral".to_string(),
                "--url".to_string(),
                self.coordinator_url.clone(),
                "--token".to_string(),
                spec.token.clone(),
                "--name".to_string(),
                format!("runner-{}", spec.index),
                "--labels".to_string(),
                spec.labels.join(","),
            ],
        )
        .await
        .context("agent registration failed")?;

        // The agent keeps running after provisioning returns; it is tracked
        // through the process registry, not this child handle.
        tokio::process::Command::new("./run.sh")
            .current_dir(&dir)
            .spawn()
            .context("failed to start runner agent")?;
        tracing::info!("runner slot provisioned: slot={}", spec.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct ScriptedSetup {
        fail_slots: Vec<u32>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SlotSetup for ScriptedSetup {
        async fn provision(&self, spec: RunnerSlotSpec) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_slots.contains(&spec.index) {
                bail!("scripted failure for slot {}", spec.index);
            }
            Ok(())
        }
    }

    fn specs(count: u32) -> Vec<RunnerSlotSpec> {
        (0..count)
            .map(|index| RunnerSlotSpec {
                index,
                token: format!("token-{index}"),
                labels: vec!["self-hosted".to_string(), format!("slot-{index}")],
            })
            .collect()
    }

    #[tokio::test]
    async fn functional_all_slots_succeed() {
        let temp = tempdir().expect("tempdir");
        let lifecycle = Arc::new(InstanceLifecycleState::new());
        let setup = Arc::new(ScriptedSetup {
            fail_slots: vec![],
            calls: AtomicUsize::new(0),
        });

        let outcome = provision_slots(
            Arc::clone(&setup) as Arc<dyn SlotSetup>,
            specs(3),
            Arc::clone(&lifecycle),
            &ControllerEventLog::new(temp.path()),
        )
        .await;

        assert_eq!(outcome.succeeded, 3);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.status, ProvisionStatus::FullSuccess);
        assert_eq!(setup.calls.load(Ordering::SeqCst), 3);
        assert!(lifecycle.is_registered());
    }

    #[tokio::test]
    async fn functional_partial_failure_is_degraded_but_registered() {
        let temp = tempdir().expect("tempdir");
        let lifecycle = Arc::new(InstanceLifecycleState::new());
        let setup = Arc::new(ScriptedSetup {
            fail_slots: vec![1],
            calls: AtomicUsize::new(0),
        });

        let outcome = provision_slots(
            setup as Arc<dyn SlotSetup>,
            specs(3),
            Arc::clone(&lifecycle),
            &ControllerEventLog::new(temp.path()),
        )
        .await;

        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.status, ProvisionStatus::Degraded);
        assert!(lifecycle.is_registered());
        assert_eq!(outcome.succeeded + outcome.failed, 3);
    }

    #[tokio::test]
    async fn functional_total_failure_reports_all_failed() {
        let temp = tempdir().expect("tempdir");
        let lifecycle = Arc::new(InstanceLifecycleState::new());
        let setup = Arc::new(ScriptedSetup {
            fail_slots: vec![0, 1],
            calls: AtomicUsize::new(0),
        });

        let outcome = provision_slots(
            setup as Arc<dyn SlotSetup>,
            specs(2),
            Arc::clone(&lifecycle),
            &ControllerEventLog::new(temp.path()),
        )
        .await;

        assert_eq!(outcome.status, ProvisionStatus::AllFailed);
        assert!(!lifecycle.is_registered());

        let raw = std::fs::read_to_string(
            ControllerEventLog::new(temp.path()).events_path(),
        )
        .expect("events");
        assert!(raw.contains("\"reason_code\":\"all_runners_failed\""));
    }

    struct PanickingSetup;

    #[async_trait]
    impl SlotSetup for PanickingSetup {
        async fn provision(&self, spec: RunnerSlotSpec) -> Result<()> {
            if spec.index == 0 {
                panic!("slot task died");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn regression_panicking_slot_counts_as_failed() {
        let temp = tempdir().expect("tempdir");
        let lifecycle = Arc::new(InstanceLifecycleState::new());

        let outcome = provision_slots(
            Arc::new(PanickingSetup) as Arc<dyn SlotSetup>,
            specs(2),
            lifecycle,
            &ControllerEventLog::new(temp.path()),
        )
        .await;

        assert_eq!(outcome.succeeded + outcome.failed, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.status, ProvisionStatus::Degraded);
    }

    #[tokio::test]
    async fn regression_zero_slots_is_full_success() {
        let temp = tempdir().expect("tempdir");
        let outcome = provision_slots(
            Arc::new(ScriptedSetup {
                fail_slots: vec![],
                calls: AtomicUsize::new(0),
            }) as Arc<dyn SlotSetup>,
            Vec::new(),
            Arc::new(InstanceLifecycleState::new()),
            &ControllerEventLog::new(temp.path()),
        )
        .await;
        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.status, ProvisionStatus::FullSuccess);
    }
}
