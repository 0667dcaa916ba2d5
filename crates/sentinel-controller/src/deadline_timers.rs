use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::controller_events::ControllerEventLog;
use crate::lifecycle_state::InstanceLifecycleState;
use crate::shutdown_sequencer::{PowerOffPlan, ShutdownReason, ShutdownSequencer};

/// Handle to a cancellable deadline task. Dropping the handle without
/// calling `cancel` leaves the deadline armed.
#[derive(Debug)]
pub struct WatchdogHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Disarms the deadline. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            // A closed receiver means the deadline already fired.
            let _ = cancel_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Arms the registration watchdog: if no runner slot registers with the
/// coordinator before the timeout, the instance is torn down. Cancellation
/// races with expiry, so the registered flag is re-checked at the deadline.
pub fn arm_registration_watchdog(
    timeout: Duration,
    lifecycle: Arc<InstanceLifecycleState>,
    sequencer: Arc<ShutdownSequencer>,
) -> WatchdogHandle {
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if lifecycle.is_registered() {
                    tracing::debug!("registration watchdog expired after registration, ignoring");
                    return;
                }
                tracing::error!(
                    "no runner registered within {}s, shutting down",
                    timeout.as_secs()
                );
                sequencer.run(ShutdownReason::RegistrationTimeout).await;
            }
            _ = &mut cancel_rx => {
                tracing::debug!("registration watchdog cancelled");
            }
        }
    });
    WatchdogHandle {
        cancel_tx: Some(cancel_tx),
        task: Some(task),
    }
}

/// Arms the absolute lifetime ceiling. Unlike the watchdog this is never
/// cancelled by activity: when it fires the instance dies, running jobs or
/// not, through the full shutdown sequence.
pub fn arm_max_lifetime_enforcer(
    lifetime: Duration,
    sequencer: Arc<ShutdownSequencer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(lifetime).await;
        tracing::error!(
            "max instance lifetime of {}m reached, shutting down",
            lifetime.as_secs() / 60
        );
        sequencer.run(ShutdownReason::MaxLifetimeReached).await;
    })
}

/// Arms the last-resort kill path: at the same lifetime deadline it drives
/// the power-off chain directly, bypassing the sequencer and its latch, in
/// case the sequencer task itself is wedged. Harmless when the orderly path
/// already powered the instance off.
pub fn arm_failsafe_kill(
    lifetime: Duration,
    power: PowerOffPlan,
    events: ControllerEventLog,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(lifetime).await;
        tracing::error!("failsafe kill firing at max lifetime");
        power.execute(&events).await;
    })
}
