use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

use sentinel_core::current_unix_timestamp_ms;

use sentinel_controller::{
    arm_max_lifetime_enforcer, arm_registration_watchdog, provision_slots, run_decision_loop,
    ControllerConfig, ControllerEventLog, DecisionEngine, InstanceLifecycleState, JobIdentity,
    JobRecordStore, JobTracker, PowerOffPlan, PowerStrategy, ProcessRegistry, ProvisionStatus,
    RunnerSlotSpec, ShutdownReason, ShutdownSequencer, ShutdownSequencerConfig, SlotSetup,
    SlotTeardown, StaticProcessRegistry,
};

struct Deployment {
    temp: TempDir,
    store: Arc<JobRecordStore>,
    lifecycle: Arc<InstanceLifecycleState>,
    registry: Arc<StaticProcessRegistry>,
    events: ControllerEventLog,
    engine: DecisionEngine,
}

fn deployment() -> Deployment {
    let temp = tempdir().expect("tempdir");
    let config = ControllerConfig {
        state_dir: temp.path().to_path_buf(),
        poll_interval: Duration::from_secs(10),
        runner_grace_period: Duration::from_secs(60),
        runner_initial_grace_period: Duration::from_secs(180),
        ..ControllerConfig::default()
    };
    let store = Arc::new(JobRecordStore::open(temp.path()).expect("store"));
    let lifecycle = Arc::new(InstanceLifecycleState::new());
    let registry = Arc::new(StaticProcessRegistry::new());
    let events = ControllerEventLog::new(temp.path());
    let engine = DecisionEngine::new(
        config,
        Arc::clone(&store),
        Arc::clone(&lifecycle),
        Arc::clone(&registry) as Arc<dyn ProcessRegistry>,
        events.clone(),
    );
    Deployment {
        temp,
        store,
        lifecycle,
        registry,
        events,
        engine,
    }
}

fn appending_command(marker: &Path, line: &str) -> Vec<String> {
    if cfg!(windows) {
        vec![
            "cmd".to_string(),
            "/C".to_string(),
            format!("echo {line}>> {}", marker.display()),
        ]
    } else {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo {line} >> {}", marker.display()),
        ]
    }
}

fn marker_power_plan(marker: &Path) -> PowerOffPlan {
    let command = appending_command(marker, "powered");
    PowerOffPlan {
        strategies: vec![PowerStrategy::Command {
            program: command[0].clone(),
            args: command[1..].to_vec(),
        }],
        per_strategy_timeout: Duration::from_secs(5),
    }
}

/// No-process power plan for tests that run under a paused clock, where a
/// spawned child would lose the race against auto-advanced timeouts.
fn inert_sequencer(state_dir: &Path) -> Arc<ShutdownSequencer> {
    let power = PowerOffPlan {
        strategies: Vec::new(),
        per_strategy_timeout: Duration::from_secs(1),
    };
    Arc::new(ShutdownSequencer::new(
        ShutdownSequencerConfig::new(power),
        ControllerEventLog::new(state_dir),
    ))
}

fn event_lines(events: &ControllerEventLog) -> Vec<String> {
    std::fs::read_to_string(events.events_path())
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn job_lifecycle_runs_through_idle_termination_and_teardown() {
    let deployment = deployment();
    let tracker = JobTracker::new(
        Arc::clone(&deployment.store),
        Arc::clone(&deployment.lifecycle),
        deployment.events.clone(),
    );
    let identity = JobIdentity::new("run-100", "build", 0);
    // Hooks stamp wall-clock time, so cycle timestamps are anchored to it.
    let base = current_unix_timestamp_ms();

    // Job starts and the slot shows listener+worker: the record survives.
    tracker.on_job_started(&identity).expect("start hook");
    deployment.registry.set_slot(0, true, true);
    let busy = deployment.engine.evaluate_cycle(base + 10_000);
    assert_eq!(busy.active_job_count, 1);
    assert!(!busy.terminate);

    // Job completes through the hook; the slot drops back to listener-only.
    tracker.on_job_completed(&identity).expect("complete hook");
    deployment.registry.set_slot(0, true, false);
    let drained = deployment.engine.evaluate_cycle(base + 20_000);
    assert_eq!(drained.active_job_count, 0);
    assert!(!drained.terminate);

    // Sixty-one extra seconds past the completion activity the grace expires.
    let expired = deployment.engine.evaluate_cycle(base + 20_000 + 61_000);
    assert!(expired.terminate);

    // Teardown the way the decision loop would, with observable side
    // effects standing in for the real commands.
    let stop_marker = deployment.temp.path().join("stop.marker");
    let deregister_marker = deployment.temp.path().join("deregister.marker");
    let power_marker = deployment.temp.path().join("power.marker");
    let mut config = ShutdownSequencerConfig::new(marker_power_plan(&power_marker));
    config.slots = vec![SlotTeardown {
        slot: 0,
        stop_command: Some(appending_command(&stop_marker, "stopped")),
        deregister_command: Some(appending_command(&deregister_marker, "removed")),
    }];
    let sequencer = Arc::new(ShutdownSequencer::new(config, deployment.events.clone()));
    assert!(sequencer.run(ShutdownReason::IdleTimeout).await);

    assert!(stop_marker.exists());
    assert!(deregister_marker.exists());
    assert!(power_marker.exists());

    let lines = event_lines(&deployment.events);
    let started = lines
        .iter()
        .position(|line| line.contains("\"event\":\"shutdown_started\""))
        .expect("shutdown_started event");
    let completed = lines
        .iter()
        .position(|line| line.contains("\"event\":\"shutdown_completed\""))
        .expect("shutdown_completed event");
    assert!(started < completed);
    assert!(lines[started].contains("idle_timeout"));
}

#[tokio::test]
async fn hook_activity_crosses_the_process_boundary_to_the_daemon() {
    let temp = tempdir().expect("tempdir");
    let config = ControllerConfig {
        state_dir: temp.path().to_path_buf(),
        poll_interval: Duration::from_secs(10),
        runner_grace_period: Duration::from_secs(60),
        runner_initial_grace_period: Duration::from_secs(180),
        ..ControllerConfig::default()
    };

    // Hook-side state, built fresh the way a short-lived hook process
    // builds it, sharing nothing in memory with the daemon below.
    let tracker = JobTracker::new(
        Arc::new(JobRecordStore::open(temp.path()).expect("hook store")),
        Arc::new(InstanceLifecycleState::open(temp.path()).expect("hook lifecycle")),
        ControllerEventLog::new(temp.path()),
    );

    let registry = Arc::new(StaticProcessRegistry::new());
    let engine = DecisionEngine::new(
        config,
        Arc::new(JobRecordStore::open(temp.path()).expect("daemon store")),
        Arc::new(InstanceLifecycleState::open(temp.path()).expect("daemon lifecycle")),
        Arc::clone(&registry) as Arc<dyn ProcessRegistry>,
        ControllerEventLog::new(temp.path()),
    );

    let identity = JobIdentity::new("run-300", "deploy", 0);
    let base = current_unix_timestamp_ms();

    tracker.on_job_started(&identity).expect("start hook");
    registry.set_slot(0, true, true);
    let busy = engine.evaluate_cycle(base + 2_000);
    assert_eq!(busy.active_job_count, 1);

    tracker.on_job_completed(&identity).expect("complete hook");
    registry.set_slot(0, true, false);

    // Seconds after the completion the daemon must see the hook's
    // activity: post-first-job grace in effect and the idle clock
    // measuring from the completion, not from boot.
    let drained = engine.evaluate_cycle(base + 7_000);
    assert_eq!(drained.active_job_count, 0);
    assert_eq!(drained.grace_seconds, 60);
    assert!(drained.idle_seconds <= 7);
    assert!(!drained.terminate);

    let expired = engine.evaluate_cycle(base + 7_000 + 61_000);
    assert!(expired.terminate);
}

#[tokio::test]
async fn unclean_worker_exit_counts_as_completion_and_restarts_grace() {
    let deployment = deployment();
    let tracker = JobTracker::new(
        Arc::clone(&deployment.store),
        Arc::clone(&deployment.lifecycle),
        deployment.events.clone(),
    );
    let identity = JobIdentity::new("run-200", "flaky-suite", 1);
    let base = current_unix_timestamp_ms();

    tracker.on_job_started(&identity).expect("start hook");
    deployment.registry.set_slot(1, true, true);
    deployment.engine.evaluate_cycle(base + 10_000);

    // Worker vanishes without the completion hook ever running.
    deployment.registry.set_slot(1, true, false);
    let reclassified = deployment.engine.evaluate_cycle(base + 50_000);
    assert_eq!(reclassified.active_job_count, 0);
    assert!(deployment.store.scan().records.is_empty());
    // The implicit completion restarted the idle clock at the sweep time.
    assert_eq!(reclassified.idle_seconds, 0);

    let still_waiting = deployment.engine.evaluate_cycle(base + 50_000 + 60_000);
    assert!(!still_waiting.terminate);
    let expired = deployment.engine.evaluate_cycle(base + 50_000 + 61_000);
    assert!(expired.terminate);

    let lines = event_lines(&deployment.events);
    assert!(lines
        .iter()
        .any(|line| line.contains("\"event\":\"implicit_completion\"")));
}

#[tokio::test(start_paused = true)]
async fn registration_timeout_tears_down_an_unregistered_instance() {
    let temp = tempdir().expect("tempdir");
    let lifecycle = Arc::new(InstanceLifecycleState::new());
    let sequencer = inert_sequencer(temp.path());

    let _watchdog = arm_registration_watchdog(
        Duration::from_secs(300),
        Arc::clone(&lifecycle),
        Arc::clone(&sequencer),
    );
    tokio::time::sleep(Duration::from_secs(301)).await;
    tokio::task::yield_now().await;

    assert!(sequencer.is_triggered());
    let lines = event_lines(&ControllerEventLog::new(temp.path()));
    assert!(lines
        .iter()
        .any(|line| line.contains("registration_timeout")));
}

struct AlwaysFailingSetup;

#[async_trait]
impl SlotSetup for AlwaysFailingSetup {
    async fn provision(&self, spec: RunnerSlotSpec) -> Result<()> {
        bail!("coordinator rejected slot {}", spec.index)
    }
}

#[tokio::test]
async fn total_provisioning_failure_triggers_all_runners_failed_teardown() {
    let temp = tempdir().expect("tempdir");
    let lifecycle = Arc::new(InstanceLifecycleState::new());
    let events = ControllerEventLog::new(temp.path());

    let specs = (0..2)
        .map(|index| RunnerSlotSpec {
            index,
            token: format!("tok-{index}"),
            labels: vec!["self-hosted".to_string()],
        })
        .collect();
    let outcome = provision_slots(
        Arc::new(AlwaysFailingSetup) as Arc<dyn SlotSetup>,
        specs,
        Arc::clone(&lifecycle),
        &events,
    )
    .await;
    assert_eq!(outcome.status, ProvisionStatus::AllFailed);
    assert!(!lifecycle.is_registered());

    let sequencer = inert_sequencer(temp.path());
    assert!(sequencer.run(ShutdownReason::AllRunnersFailed).await);
    let lines = event_lines(&events);
    assert!(lines
        .iter()
        .any(|line| line.contains("all_runners_failed")));
    assert!(lines
        .iter()
        .any(|line| line.contains("\"event\":\"shutdown_started\"")
            && line.contains("all_runners_failed")));
}

#[tokio::test(start_paused = true)]
async fn competing_deadlines_tear_down_exactly_once() {
    let temp = tempdir().expect("tempdir");
    let lifecycle = Arc::new(InstanceLifecycleState::new());
    let sequencer = inert_sequencer(temp.path());

    let _watchdog = arm_registration_watchdog(
        Duration::from_secs(30),
        Arc::clone(&lifecycle),
        Arc::clone(&sequencer),
    );
    let _enforcer = arm_max_lifetime_enforcer(Duration::from_secs(60), Arc::clone(&sequencer));
    tokio::time::sleep(Duration::from_secs(120)).await;
    tokio::task::yield_now().await;

    let lines = event_lines(&ControllerEventLog::new(temp.path()));
    let shutdowns = lines
        .iter()
        .filter(|line| line.contains("\"event\":\"shutdown_started\""))
        .count();
    assert_eq!(shutdowns, 1);
}

#[tokio::test(start_paused = true)]
async fn decision_loop_exits_once_shutdown_is_in_progress() {
    let deployment = deployment();
    let sequencer = inert_sequencer(deployment.temp.path());
    assert!(sequencer.run(ShutdownReason::MaxLifetimeReached).await);

    let engine = Arc::new(deployment.engine);
    let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let loop_task = tokio::spawn(run_decision_loop(
        engine,
        Arc::clone(&sequencer),
        shutdown_rx,
    ));
    tokio::time::timeout(Duration::from_secs(60), loop_task)
        .await
        .expect("loop must exit promptly")
        .expect("loop task");
}

#[tokio::test]
async fn decision_loop_exits_on_shutdown_signal() {
    let deployment = deployment();
    let sequencer = inert_sequencer(deployment.temp.path());

    let engine = Arc::new(deployment.engine);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let loop_task = tokio::spawn(run_decision_loop(engine, sequencer, shutdown_rx));
    shutdown_tx.send(()).expect("send shutdown");
    tokio::time::timeout(Duration::from_secs(5), loop_task)
        .await
        .expect("loop must exit promptly")
        .expect("loop task");
}
