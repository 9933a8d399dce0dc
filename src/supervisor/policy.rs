use crate::rpc::WorkerInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Derived worker lifecycle phase exposed to the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerPhase {
    /// Process spawned, not yet confirmed responsive
    Starting,
    /// Liveness probes passing
    Ready,
    /// Probes missed; restart may follow
    Degraded,
    /// Tearing down / backing off before respawn
    Restarting,
    /// Auto-restart bound exhausted; manual restart required
    Failed,
}

/// Bounded exponential backoff with a consecutive-failure limit.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(15),
            max_consecutive_failures: 5,
        }
    }
}

impl RestartPolicy {
    /// Delay before the next spawn attempt after `failures` consecutive
    /// failures. Monotonically non-decreasing and capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(1u32 << exp);
        delay.min(self.max_backoff)
    }

    /// True once auto-restart must stop.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_consecutive_failures
    }
}

/// Health bookkeeping for the single worker process. Owned exclusively by the
/// supervisor; everyone else sees `HealthSnapshot` copies.
#[derive(Debug)]
pub struct HealthRecord {
    pub phase: WorkerPhase,
    pub consecutive_failures: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub info: Option<WorkerInfo>,
    healthy_since: Option<Instant>,
}

impl HealthRecord {
    pub fn new() -> Self {
        Self {
            phase: WorkerPhase::Starting,
            consecutive_failures: 0,
            last_restart_at: None,
            info: None,
            healthy_since: None,
        }
    }

    /// A liveness probe answered.
    pub fn record_ready(&mut self, now: Instant) {
        self.phase = WorkerPhase::Ready;
        self.healthy_since.get_or_insert(now);
    }

    /// A probe was missed; the healthy streak is broken.
    pub fn record_degraded(&mut self) {
        self.phase = WorkerPhase::Degraded;
        self.healthy_since = None;
    }

    /// The worker crashed, hung past the probe budget, or failed to spawn.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.healthy_since = None;
        self.info = None;
    }

    pub fn record_restarting(&mut self) {
        self.phase = WorkerPhase::Restarting;
        self.last_restart_at = Some(Utc::now());
        self.healthy_since = None;
        self.info = None;
    }

    /// Manual restart clears the failure count immediately.
    pub fn record_manual_restart(&mut self) {
        self.consecutive_failures = 0;
        self.record_restarting();
    }

    /// Resets the failure count only after a sustained healthy period, so a
    /// single successful restart cannot mask a flapping worker. Returns true
    /// if the counter was cleared.
    pub fn maybe_clear_failures(&mut self, now: Instant, sustain: Duration) -> bool {
        match self.healthy_since {
            Some(since) if self.consecutive_failures > 0 && now.duration_since(since) >= sustain => {
                self.consecutive_failures = 0;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            phase: self.phase,
            consecutive_failures: self.consecutive_failures,
            last_restart_at: self.last_restart_at,
            info: self.info.clone(),
        }
    }
}

/// Read-only health view for the status-indicator collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub phase: WorkerPhase,
    pub consecutive_failures: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub info: Option<WorkerInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_and_capped() {
        let policy = RestartPolicy {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(15),
            max_consecutive_failures: 5,
        };

        let mut previous = Duration::ZERO;
        for failures in 1..12 {
            let delay = policy.backoff(failures);
            assert!(delay >= previous, "backoff must not decrease");
            assert!(delay <= policy.max_backoff);
            previous = delay;
        }
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(30), Duration::from_secs(15));
    }

    #[test]
    fn exhaustion_bound() {
        let policy = RestartPolicy {
            max_consecutive_failures: 3,
            ..Default::default()
        };
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn failures_clear_only_after_sustained_health() {
        let mut record = HealthRecord::new();
        let start = Instant::now();
        record.record_failure();
        record.record_failure();
        assert_eq!(record.consecutive_failures, 2);

        record.record_ready(start);

        // One healthy probe is not enough.
        assert!(!record.maybe_clear_failures(start + Duration::from_secs(5), Duration::from_secs(60)));
        assert_eq!(record.consecutive_failures, 2);

        // A probe miss restarts the healthy clock.
        record.record_degraded();
        record.record_ready(start + Duration::from_secs(30));
        assert!(!record.maybe_clear_failures(start + Duration::from_secs(70), Duration::from_secs(60)));

        // Sustained health clears the counter.
        assert!(record.maybe_clear_failures(start + Duration::from_secs(95), Duration::from_secs(60)));
        assert_eq!(record.consecutive_failures, 0);
    }

    #[test]
    fn manual_restart_zeroes_the_counter() {
        let mut record = HealthRecord::new();
        record.record_failure();
        record.record_failure();
        record.phase = WorkerPhase::Failed;

        record.record_manual_restart();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.phase, WorkerPhase::Restarting);
    }
}
