//! Crash-restart policy for worker directories.
//!
//! Each directory has a [`RestartRecord`] that counts abnormal exits within a
//! sliding window. State machine per directory:
//!
//! ```text
//! Idle --abnormal exit--> Counted(1) --> ... --> Counted(M) --> Exhausted
//!   ^                                                               |
//!   +---------------- window start older than `window` -------------+
//! ```
//!
//! Only the crash-triggered auto-restart path consults the tracker. Explicit
//! start/restart calls are never gated, and they do not clear a record either;
//! only the window does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use taskhost_types::config::RestartSettings;
use tokio::time::Instant;

use crate::backoff::BackoffPolicy;

/// Bounds for automatic restarts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Window after which the attempt counter resets.
    pub window: Duration,
    /// Maximum automatic restarts within one window.
    pub max_attempts: u32,
    /// Delay for the n-th restart is `backoff.next(n - 1)`.
    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            max_attempts: 6,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl From<&RestartSettings> for RestartPolicy {
    fn from(settings: &RestartSettings) -> Self {
        Self {
            window: Duration::from_secs(settings.window_secs),
            max_attempts: settings.max_attempts,
            backoff: BackoffPolicy::doubling(
                Duration::from_millis(settings.base_delay_ms),
                Duration::from_millis(settings.max_delay_ms),
            ),
        }
    }
}

/// Abnormal-exit bookkeeping for one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRecord {
    pub count: u32,
    pub window_start: Instant,
}

/// Outcome of consulting the policy after an abnormal exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`; `attempt` is the count within the current window.
    Allowed { attempt: u32, delay: Duration },
    /// The window's budget is spent.
    Exhausted { attempts: u32 },
}

/// Per-directory restart records.
#[derive(Debug, Default)]
pub struct RestartTracker {
    policy: RestartPolicy,
    records: HashMap<PathBuf, RestartRecord>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Record an abnormal exit of `directory` at `now` and decide whether to restart.
    pub fn record_abnormal_exit(&mut self, directory: &Path, now: Instant) -> RestartDecision {
        let policy = self.policy;

        let record = match self.records.get_mut(directory) {
            Some(record) if now.saturating_duration_since(record.window_start) <= policy.window => {
                record
            }
            _ => {
                let fresh = RestartRecord {
                    count: 1,
                    window_start: now,
                };
                self.records.insert(directory.to_path_buf(), fresh);
                return RestartDecision::Allowed {
                    attempt: 1,
                    delay: policy.backoff.next(0),
                };
            }
        };

        if record.count < policy.max_attempts {
            record.count += 1;
            RestartDecision::Allowed {
                attempt: record.count,
                delay: policy.backoff.next(record.count - 1),
            }
        } else {
            RestartDecision::Exhausted {
                attempts: record.count,
            }
        }
    }

    pub fn record(&self, directory: &Path) -> Option<&RestartRecord> {
        self.records.get(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_policy() -> RestartPolicy {
        RestartPolicy {
            window: Duration::from_millis(60_000),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }

    #[test]
    fn test_three_exits_allowed_with_increasing_delay_then_denied() {
        let mut tracker = RestartTracker::new(small_policy());
        let dir = Path::new("/app/billing");
        let t0 = Instant::now();

        let d1 = tracker.record_abnormal_exit(dir, t0);
        let d2 = tracker.record_abnormal_exit(dir, t0 + Duration::from_secs(3));
        let d3 = tracker.record_abnormal_exit(dir, t0 + Duration::from_secs(7));
        let d4 = tracker.record_abnormal_exit(dir, t0 + Duration::from_secs(9));

        assert_eq!(
            d1,
            RestartDecision::Allowed {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            d2,
            RestartDecision::Allowed {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            d3,
            RestartDecision::Allowed {
                attempt: 3,
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(d4, RestartDecision::Exhausted { attempts: 3 });
        assert_eq!(tracker.record(dir).unwrap().count, 3);
    }

    #[test]
    fn test_window_expiry_resets_counter() {
        let mut tracker = RestartTracker::new(small_policy());
        let dir = Path::new("/app/billing");
        let t0 = Instant::now();

        for offset in [0, 2, 4] {
            tracker.record_abnormal_exit(dir, t0 + Duration::from_secs(offset));
        }
        assert!(matches!(
            tracker.record_abnormal_exit(dir, t0 + Duration::from_secs(10)),
            RestartDecision::Exhausted { .. }
        ));

        let later = tracker.record_abnormal_exit(dir, t0 + Duration::from_secs(61));
        assert_eq!(
            later,
            RestartDecision::Allowed {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(tracker.record(dir).unwrap().count, 1);
    }

    #[test]
    fn test_count_never_exceeds_max_within_window() {
        let mut tracker = RestartTracker::new(small_policy());
        let dir = Path::new("/app/x");
        let t0 = Instant::now();

        for i in 0..20 {
            tracker.record_abnormal_exit(dir, t0 + Duration::from_millis(i * 100));
            assert!(tracker.record(dir).unwrap().count <= 3);
        }
    }

    #[test]
    fn test_directories_are_independent() {
        let mut tracker = RestartTracker::new(small_policy());
        let t0 = Instant::now();

        for _ in 0..3 {
            tracker.record_abnormal_exit(Path::new("/app/a"), t0);
        }
        assert!(matches!(
            tracker.record_abnormal_exit(Path::new("/app/a"), t0),
            RestartDecision::Exhausted { .. }
        ));
        assert!(matches!(
            tracker.record_abnormal_exit(Path::new("/app/b"), t0),
            RestartDecision::Allowed { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RestartPolicy {
            window: Duration::from_secs(600),
            max_attempts: 10,
            backoff: BackoffPolicy::default(),
        };
        let mut tracker = RestartTracker::new(policy);
        let t0 = Instant::now();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            if let RestartDecision::Allowed { delay, .. } =
                tracker.record_abnormal_exit(Path::new("/app/a"), t0)
            {
                last = delay;
            }
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = RestartSettings {
            window_secs: 60,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 4_000,
        };
        let policy = RestartPolicy::from(&settings);
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.next(0), Duration::from_millis(500));
        assert_eq!(policy.backoff.next(10), Duration::from_secs(4));
    }
}
