//! Lifecycle controller for ephemeral CI runner instances.
//!
//! Everything that decides when an instance must die and how it dies lives
//! here: the durable job record store mutated by the runner agent's job
//! hooks, the process registry that classifies runner slots as
//! active/idle/dead, the periodic termination decision engine, the
//! registration watchdog and max-lifetime enforcer, the parallel slot
//! provisioner, and the terminal shutdown sequencer with its ordered
//! power-off fallback chain.

pub mod config;
pub mod control_plane_client;
pub mod controller_events;
pub mod decision_engine;
pub mod deadline_timers;
pub mod job_record_store;
pub mod job_tracker;
pub mod lifecycle_state;
pub mod process_registry;
pub mod provisioner;
pub mod shutdown_sequencer;

pub use config::ControllerConfig;
pub use control_plane_client::ControlPlaneClient;
pub use controller_events::{ControllerEventLog, ControllerHealthSnapshot};
pub use decision_engine::{run_decision_loop, DecisionEngine, TerminationDecision};
pub use deadline_timers::{
    arm_failsafe_kill, arm_max_lifetime_enforcer, arm_registration_watchdog, WatchdogHandle,
};
pub use job_record_store::{JobIdentity, JobRecord, JobRecordStore, JobStatus};
pub use job_tracker::JobTracker;
pub use lifecycle_state::{InstanceLifecycleState, LifecycleSnapshot};
pub use process_registry::{
    ProcessRegistry, SlotClassification, SlotProcessState, StaticProcessRegistry,
    SystemProcessRegistry,
};
pub use provisioner::{
    provision_slots, ProvisionOutcome, ProvisionStatus, RunnerSlotSpec, ShellSlotSetup, SlotSetup,
};
pub use shutdown_sequencer::{
    PowerOffPlan, PowerStrategy, ShutdownReason, ShutdownSequencer, ShutdownSequencerConfig,
    SlotTeardown,
};
