use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::process::Command;

use crate::control_plane_client::ControlPlaneClient;
use crate::controller_events::{
    ControllerEventLog, REASON_SHUTDOWN_COMPLETED, REASON_SHUTDOWN_STARTED,
    REASON_SHUTDOWN_STEP_FAILED,
};

const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 30;
const SYSRQ_TRIGGER_PATH: &str = "/proc/sysrq-trigger";

/// Why the instance is terminating. Fatal conditions always route through
/// the sequencer so deregistration and flush still happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    IdleTimeout,
    RegistrationTimeout,
    MaxLifetimeReached,
    AllRunnersFailed,
    AssetDownloadFailed,
}

impl ShutdownReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::RegistrationTimeout => "registration_timeout",
            Self::MaxLifetimeReached => "max_lifetime_reached",
            Self::AllRunnersFailed => "all_runners_failed",
            Self::AssetDownloadFailed => "asset_download_failed",
        }
    }
}

/// One way of making the instance go away. Strategies are tried in order;
/// each is only attempted when every previous one was unavailable or failed.
#[derive(Debug, Clone)]
pub enum PowerStrategy {
    /// Local privileged command, e.g. `shutdown -h now` or `halt -f`.
    Command { program: String, args: Vec<String> },
    /// Low-level forced reboot trigger for when even `halt` is wedged.
    SysrqTrigger { trigger_path: PathBuf },
    /// Explicit terminate call to the compute control plane, for platforms
    /// where the instance has no local shutdown privilege.
    ControlPlaneTerminate {
        client: ControlPlaneClient,
        instance_id: String,
    },
}

impl PowerStrategy {
    fn describe(&self) -> String {
        match self {
            Self::Command { program, args } => format!("command:{program} {}", args.join(" ")),
            Self::SysrqTrigger { trigger_path } => {
                format!("sysrq:{}", trigger_path.display())
            }
            Self::ControlPlaneTerminate { instance_id, .. } => {
                format!("control_plane_terminate:{instance_id}")
            }
        }
    }

    async fn attempt(&self, timeout: Duration) -> Result<()> {
        match self {
            Self::Command { program, args } => {
                let succeeded = run_command_bounded(program, args, timeout).await?;
                if !succeeded {
                    bail!("{program} exited unsuccessfully");
                }
                Ok(())
            }
            Self::SysrqTrigger { trigger_path } => std::fs::write(trigger_path, "b")
                .with_context(|| format!("failed to write {}", trigger_path.display())),
            Self::ControlPlaneTerminate {
                client,
                instance_id,
            } => {
                tokio::time::timeout(timeout, client.terminate(instance_id))
                    .await
                    .context("control plane terminate timed out")??;
                Ok(())
            }
        }
    }
}

/// Ordered power-off fallback chain with a per-strategy timeout.
#[derive(Debug, Clone)]
pub struct PowerOffPlan {
    pub strategies: Vec<PowerStrategy>,
    pub per_strategy_timeout: Duration,
}

impl PowerOffPlan {
    /// Privileged local chain: graceful power-off, forced halt, then the
    /// sysrq reboot trigger.
    pub fn local_chain() -> Self {
        Self {
            strategies: vec![
                PowerStrategy::Command {
                    program: "shutdown".to_string(),
                    args: vec!["-h".to_string(), "now".to_string()],
                },
                PowerStrategy::Command {
                    program: "halt".to_string(),
                    args: vec!["-f".to_string()],
                },
                PowerStrategy::SysrqTrigger {
                    trigger_path: PathBuf::from(SYSRQ_TRIGGER_PATH),
                },
            ],
            per_strategy_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECONDS),
        }
    }

    /// API-key platforms: terminate through the control plane instead of a
    /// local privileged shutdown.
    pub fn control_plane(client: ControlPlaneClient, instance_id: impl Into<String>) -> Self {
        Self {
            strategies: vec![PowerStrategy::ControlPlaneTerminate {
                client,
                instance_id: instance_id.into(),
            }],
            per_strategy_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECONDS),
        }
    }

    /// Tries each strategy in order; returns true when one reports success.
    pub async fn execute(&self, events: &ControllerEventLog) -> bool {
        for strategy in &self.strategies {
            match strategy.attempt(self.per_strategy_timeout).await {
                Ok(()) => {
                    events.append_event_best_effort(
                        "power_off",
                        REASON_SHUTDOWN_COMPLETED,
                        &strategy.describe(),
                    );
                    return true;
                }
                Err(error) => {
                    tracing::warn!(
                        "power strategy failed, trying next: strategy={} error={error}",
                        strategy.describe()
                    );
                    events.append_event_best_effort(
                        "power_off_attempt",
                        REASON_SHUTDOWN_STEP_FAILED,
                        &format!("{} error={error}", strategy.describe()),
                    );
                }
            }
        }
        tracing::error!("all power strategies failed");
        false
    }
}

/// Per-slot teardown commands: graceful agent stop and coordinator
/// deregistration.
#[derive(Debug, Clone, Default)]
pub struct SlotTeardown {
    pub slot: u32,
    pub stop_command: Option<Vec<String>>,
    pub deregister_command: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ShutdownSequencerConfig {
    pub slots: Vec<SlotTeardown>,
    pub telemetry_flush_command: Option<Vec<String>>,
    pub step_timeout: Duration,
    pub power: PowerOffPlan,
}

impl ShutdownSequencerConfig {
    pub fn new(power: PowerOffPlan) -> Self {
        Self {
            slots: Vec::new(),
            telemetry_flush_command: None,
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECONDS),
            power,
        }
    }
}

/// Terminal teardown: stop agents, deregister slots, flush telemetry, power
/// off. Every step is best-effort; a one-time latch makes concurrent or
/// repeated invocation execute the steps at most once.
#[derive(Debug)]
pub struct ShutdownSequencer {
    triggered: AtomicBool,
    config: ShutdownSequencerConfig,
    events: ControllerEventLog,
}

impl ShutdownSequencer {
    pub fn new(config: ShutdownSequencerConfig, events: ControllerEventLog) -> Self {
        Self {
            triggered: AtomicBool::new(false),
            config,
            events,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Runs the teardown once. Returns false when another caller already
    /// holds the latch.
    pub async fn run(&self, reason: ShutdownReason) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        tracing::warn!("shutdown sequence starting: reason={}", reason.as_str());
        if let Err(error) = self.events.append_event(
            "shutdown_started",
            REASON_SHUTDOWN_STARTED,
            json!({ "reason": reason.as_str() }),
        ) {
            tracing::warn!("shutdown start event append failed: {error}");
        }

        self.stop_agents().await;
        self.deregister_slots().await;
        self.flush_telemetry().await;
        let powered_off = self.config.power.execute(&self.events).await;

        self.events.append_event_best_effort(
            "shutdown_completed",
            REASON_SHUTDOWN_COMPLETED,
            &format!("reason={} powered_off={powered_off}", reason.as_str()),
        );
        true
    }

    async fn stop_agents(&self) {
        for slot in &self.config.slots {
            let Some(command) = slot.stop_command.as_ref() else {
                continue;
            };
            self.run_step_command("stop_agent", &format!("slot={}", slot.slot), command)
                .await;
        }
    }

    async fn deregister_slots(&self) {
        for slot in &self.config.slots {
            let Some(command) = slot.deregister_command.as_ref() else {
                continue;
            };
            self.run_step_command("deregister", &format!("slot={}", slot.slot), command)
                .await;
        }
    }

    async fn flush_telemetry(&self) {
        let Some(command) = self.config.telemetry_flush_command.as_ref() else {
            return;
        };
        self.run_step_command("telemetry_flush", "global", command)
            .await;
    }

    async fn run_step_command(&self, step: &str, scope: &str, command: &[String]) {
        let Some((program, args)) = command.split_first() else {
            return;
        };
        match run_command_bounded(program, args, self.config.step_timeout).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("shutdown step exited unsuccessfully: step={step} {scope}");
                self.events.append_event_best_effort(
                    step,
                    REASON_SHUTDOWN_STEP_FAILED,
                    &format!("{scope} non-zero exit"),
                );
            }
            Err(error) => {
                tracing::warn!("shutdown step failed: step={step} {scope} error={error}");
                self.events.append_event_best_effort(
                    step,
                    REASON_SHUTDOWN_STEP_FAILED,
                    &format!("{scope} error={error}"),
                );
            }
        }
    }
}

async fn run_command_bounded(program: &str, args: &[String], timeout: Duration) -> Result<bool> {
    let mut command = Command::new(program);
    command.args(args);
    command.kill_on_drop(true);
    let status = tokio::time::timeout(timeout, command.status())
        .await
        .with_context(|| format!("{program} timed out after {}s", timeout.as_secs()))?
        .with_context(|| format!("failed to spawn {program}"))?;
    Ok(status.success())
}
