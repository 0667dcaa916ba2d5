use std::path::PathBuf;
use std::time::Duration;

/// Stale-heartbeat multiplier: a record whose heartbeat is older than this
/// many poll intervals can no longer be trusted.
pub const STALE_HEARTBEAT_POLL_MULTIPLIER: u32 = 3;

const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 10;
const DEFAULT_RUNNER_GRACE_PERIOD_SECONDS: u64 = 60;
const DEFAULT_RUNNER_INITIAL_GRACE_PERIOD_SECONDS: u64 = 180;
const DEFAULT_REGISTRATION_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_MAX_INSTANCE_LIFETIME_MINUTES: u64 = 360;

/// Timing and layout configuration for the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Root directory for job records, the health snapshot, and the event log.
    pub state_dir: PathBuf,
    /// Fixed period of the termination decision engine.
    pub poll_interval: Duration,
    /// Idle time tolerated between jobs once at least one job has run.
    pub runner_grace_period: Duration,
    /// Idle time tolerated before the first job ever starts.
    pub runner_initial_grace_period: Duration,
    /// Deadline for at least one runner slot to reach registered.
    pub registration_timeout: Duration,
    /// Absolute instance lifetime, independent of all activity.
    pub max_instance_lifetime: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/run/runner-sentinel"),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
            runner_grace_period: Duration::from_secs(DEFAULT_RUNNER_GRACE_PERIOD_SECONDS),
            runner_initial_grace_period: Duration::from_secs(
                DEFAULT_RUNNER_INITIAL_GRACE_PERIOD_SECONDS,
            ),
            registration_timeout: Duration::from_secs(DEFAULT_REGISTRATION_TIMEOUT_SECONDS),
            max_instance_lifetime: Duration::from_secs(
                DEFAULT_MAX_INSTANCE_LIFETIME_MINUTES * 60,
            ),
        }
    }
}

impl ControllerConfig {
    /// Age beyond which a job record heartbeat is never trusted.
    pub fn stale_heartbeat_threshold(&self) -> Duration {
        self.poll_interval * STALE_HEARTBEAT_POLL_MULTIPLIER
    }

    /// Grace period applicable given whether any job has ever run.
    pub fn grace_period(&self, has_run_job_ever: bool) -> Duration {
        if has_run_job_ever {
            self.runner_grace_period
        } else {
            self.runner_initial_grace_period
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_stale_threshold_is_three_poll_intervals() {
        let config = ControllerConfig {
            poll_interval: Duration::from_secs(10),
            ..ControllerConfig::default()
        };
        assert_eq!(config.stale_heartbeat_threshold(), Duration::from_secs(30));
    }

    #[test]
    fn unit_grace_period_switches_on_first_job() {
        let config = ControllerConfig::default();
        assert_eq!(config.grace_period(false), Duration::from_secs(180));
        assert_eq!(config.grace_period(true), Duration::from_secs(60));
    }
}
