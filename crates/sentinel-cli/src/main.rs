use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use sentinel_controller::{
    arm_failsafe_kill, arm_max_lifetime_enforcer, arm_registration_watchdog, provision_slots,
    run_decision_loop, ControlPlaneClient, ControllerConfig, ControllerEventLog, DecisionEngine,
    InstanceLifecycleState, JobIdentity, JobRecordStore, JobTracker, PowerOffPlan,
    ProcessRegistry, ProvisionStatus, RunnerSlotSpec, ShellSlotSetup, ShutdownReason,
    ShutdownSequencer, ShutdownSequencerConfig, SlotSetup, SlotTeardown, SystemProcessRegistry,
};

#[derive(Debug, Parser)]
#[command(
    name = "runner-sentinel",
    about = "Lifecycle controller for ephemeral CI runner instances",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision runner slots and supervise the instance until termination.
    Run(RunArgs),
    /// Job-start hook invoked by the runner agent.
    JobStarted(JobHookArgs),
    /// Job-completion hook invoked by the runner agent.
    JobCompleted(JobHookArgs),
    /// Print the persisted controller health snapshot.
    Status(StatusArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Root directory for job records, state, and the event log.
    #[arg(long, env = "SENTINEL_STATE_DIR", default_value = "/var/run/runner-sentinel")]
    state_dir: PathBuf,
    /// Parent directory of the per-slot runner working directories.
    #[arg(long, env = "SENTINEL_SLOTS_ROOT", default_value = "/opt/runner-slots")]
    slots_root: PathBuf,
    /// Pre-downloaded runner agent archive (tar.gz).
    #[arg(long, env = "SENTINEL_AGENT_ARCHIVE")]
    agent_archive: PathBuf,
    /// Coordinator URL the runner agents register against.
    #[arg(long, env = "SENTINEL_COORDINATOR_URL")]
    coordinator_url: String,
    /// Space- or comma-delimited registration tokens, one per slot; the
    /// token count sets the slot count.
    #[arg(long, env = "SENTINEL_RUNNER_TOKENS")]
    runner_tokens: String,
    /// Pipe-delimited label groups, one per slot (comma-separated within a
    /// group). A single group applies to every slot.
    #[arg(long, env = "SENTINEL_RUNNER_LABELS", default_value = "self-hosted")]
    runner_labels: String,
    #[arg(long, env = "SENTINEL_POLL_INTERVAL_SECONDS", default_value_t = 10, value_parser = parse_positive_u64)]
    poll_interval_seconds: u64,
    #[arg(long, env = "SENTINEL_GRACE_PERIOD_SECONDS", default_value_t = 60, value_parser = parse_positive_u64)]
    grace_period_seconds: u64,
    #[arg(long, env = "SENTINEL_INITIAL_GRACE_PERIOD_SECONDS", default_value_t = 180, value_parser = parse_positive_u64)]
    initial_grace_period_seconds: u64,
    #[arg(long, env = "SENTINEL_REGISTRATION_TIMEOUT_SECONDS", default_value_t = 300, value_parser = parse_positive_u64)]
    registration_timeout_seconds: u64,
    #[arg(long, env = "SENTINEL_MAX_LIFETIME_MINUTES", default_value_t = 360, value_parser = parse_positive_u64)]
    max_lifetime_minutes: u64,
    /// Control plane base URL; with an API key and instance id, power-off
    /// goes through the control plane instead of local shutdown.
    #[arg(long, env = "SENTINEL_CONTROL_PLANE_URL")]
    control_plane_url: Option<String>,
    #[arg(long, env = "SENTINEL_CONTROL_PLANE_API_KEY", hide_env_values = true)]
    control_plane_api_key: Option<String>,
    #[arg(long, env = "SENTINEL_INSTANCE_ID")]
    instance_id: Option<String>,
}

#[derive(Debug, Parser)]
struct JobHookArgs {
    #[arg(long, env = "SENTINEL_STATE_DIR", default_value = "/var/run/runner-sentinel")]
    state_dir: PathBuf,
    #[arg(long, env = "GITHUB_RUN_ID")]
    run_id: String,
    #[arg(long, env = "GITHUB_JOB")]
    job_name: String,
    #[arg(long, env = "SENTINEL_SLOT", default_value_t = 0)]
    slot: u32,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[arg(long, env = "SENTINEL_STATE_DIR", default_value = "/var/run/runner-sentinel")]
    state_dir: PathBuf,
}

fn parse_positive_u64(raw: &str) -> Result<u64, String> {
    match raw.parse::<u64>() {
        Ok(0) => Err("value must be greater than zero".to_string()),
        Ok(value) => Ok(value),
        Err(error) => Err(error.to_string()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_controller(args).await,
        Command::JobStarted(args) => {
            let tracker = open_tracker(&args.state_dir)?;
            tracker.on_job_started(&JobIdentity::new(args.run_id, args.job_name, args.slot))?;
            Ok(())
        }
        Command::JobCompleted(args) => {
            let tracker = open_tracker(&args.state_dir)?;
            tracker.on_job_completed(&JobIdentity::new(args.run_id, args.job_name, args.slot))?;
            Ok(())
        }
        Command::Status(args) => {
            let events = ControllerEventLog::new(&args.state_dir);
            let snapshot = events.load_health_snapshot()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).context("failed to encode snapshot")?
            );
            Ok(())
        }
    }
}

fn open_tracker(state_dir: &std::path::Path) -> Result<JobTracker> {
    let store = Arc::new(JobRecordStore::open(state_dir)?);
    // The hooks run as separate short-lived processes; the durable
    // lifecycle manifest is how their activity reaches the daemon.
    let lifecycle = Arc::new(InstanceLifecycleState::open(state_dir)?);
    Ok(JobTracker::new(
        store,
        lifecycle,
        ControllerEventLog::new(state_dir),
    ))
}

fn slot_specs(args: &RunArgs) -> Result<Vec<RunnerSlotSpec>> {
    // Tokens arrive space- or comma-delimited depending on the launcher.
    let tokens: Vec<&str> = args
        .runner_tokens
        .split(|ch: char| ch.is_whitespace() || ch == ',')
        .filter(|token| !token.is_empty())
        .collect();
    if tokens.is_empty() {
        bail!("--runner-tokens must carry at least one token");
    }
    let label_groups: Vec<Vec<String>> = args
        .runner_labels
        .split('|')
        .map(|group| {
            group
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect()
        })
        .collect();
    if label_groups.len() != 1 && label_groups.len() != tokens.len() {
        bail!(
            "--runner-labels must carry one group or exactly {} groups",
            tokens.len()
        );
    }
    Ok(tokens
        .iter()
        .enumerate()
        .map(|(index, token)| RunnerSlotSpec {
            index: index as u32,
            token: token.to_string(),
            labels: if label_groups.len() == 1 {
                label_groups[0].clone()
            } else {
                label_groups[index].clone()
            },
        })
        .collect())
}

fn power_plan(args: &RunArgs) -> Result<PowerOffPlan> {
    match (&args.control_plane_url, &args.control_plane_api_key, &args.instance_id) {
        (Some(url), Some(api_key), Some(instance_id)) => Ok(PowerOffPlan::control_plane(
            ControlPlaneClient::new(url.clone(), api_key.clone()),
            instance_id.clone(),
        )),
        (None, None, None) => Ok(PowerOffPlan::local_chain()),
        _ => bail!(
            "control plane power-off needs --control-plane-url, --control-plane-api-key, and --instance-id together"
        ),
    }
}

fn teardown_slots(setup: &ShellSlotSetup, specs: &[RunnerSlotSpec]) -> Vec<SlotTeardown> {
    specs
        .iter()
        .map(|spec| {
            let dir = setup.slot_dir(spec.index).display().to_string();
            SlotTeardown {
                slot: spec.index,
                stop_command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("cd {dir} && ./svc.sh stop || pkill -f Runner.Listener"),
                ]),
                deregister_command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("cd {dir} && ./config.sh remove --token {}", spec.token),
                ]),
            }
        })
        .collect()
}

async fn run_controller(args: RunArgs) -> Result<()> {
    let config = ControllerConfig {
        state_dir: args.state_dir.clone(),
        poll_interval: Duration::from_secs(args.poll_interval_seconds),
        runner_grace_period: Duration::from_secs(args.grace_period_seconds),
        runner_initial_grace_period: Duration::from_secs(args.initial_grace_period_seconds),
        registration_timeout: Duration::from_secs(args.registration_timeout_seconds),
        max_instance_lifetime: Duration::from_secs(args.max_lifetime_minutes * 60),
    };
    let specs = slot_specs(&args)?;
    let power = power_plan(&args)?;

    let events = ControllerEventLog::new(&config.state_dir);
    let store = Arc::new(JobRecordStore::open(&config.state_dir)?);
    let lifecycle = Arc::new(InstanceLifecycleState::open(&config.state_dir)?);
    let registry: Arc<dyn ProcessRegistry> =
        Arc::new(SystemProcessRegistry::new(&args.slots_root));
    let setup = ShellSlotSetup {
        agent_archive: args.agent_archive.clone(),
        slots_root: args.slots_root.clone(),
        coordinator_url: args.coordinator_url.clone(),
    };

    let mut sequencer_config = ShutdownSequencerConfig::new(power.clone());
    sequencer_config.slots = teardown_slots(&setup, &specs);
    let sequencer = Arc::new(ShutdownSequencer::new(sequencer_config, events.clone()));

    // Deadline tasks are armed before provisioning so a hung provisioner
    // can never outlive the instance budget.
    let mut watchdog = arm_registration_watchdog(
        config.registration_timeout,
        Arc::clone(&lifecycle),
        Arc::clone(&sequencer),
    );
    let _enforcer = arm_max_lifetime_enforcer(config.max_instance_lifetime, Arc::clone(&sequencer));
    let _failsafe = arm_failsafe_kill(config.max_instance_lifetime, power, events.clone());

    if !args.agent_archive.is_file() {
        tracing::error!(
            "runner agent archive missing: {}",
            args.agent_archive.display()
        );
        sequencer.run(ShutdownReason::AssetDownloadFailed).await;
        bail!("runner agent archive missing");
    }

    let outcome = provision_slots(
        Arc::new(setup) as Arc<dyn SlotSetup>,
        specs,
        Arc::clone(&lifecycle),
        &events,
    )
    .await;
    match outcome.status {
        ProvisionStatus::AllFailed => {
            sequencer.run(ShutdownReason::AllRunnersFailed).await;
            bail!("all runner slots failed to provision");
        }
        ProvisionStatus::Degraded => {
            tracing::warn!(
                "continuing degraded: {} of {} slots registered",
                outcome.succeeded,
                outcome.succeeded + outcome.failed
            );
            watchdog.cancel();
        }
        ProvisionStatus::FullSuccess => {
            tracing::info!("all {} runner slot(s) registered", outcome.succeeded);
            watchdog.cancel();
        }
    }

    let engine = Arc::new(DecisionEngine::new(
        config,
        store,
        lifecycle,
        registry,
        events,
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping decision loop");
            let _ = shutdown_tx.send(());
        }
    });
    run_decision_loop(engine, sequencer, shutdown_rx).await;
    Ok(())
}
