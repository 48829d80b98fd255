//! Adaptive poll interval.
//!
//! The interval between reconciliations grows as the cached node count
//! crosses fixed thresholds. A manual override latches for the life of the
//! controller and stops all automatic adjustment. Changing the rate cancels
//! the pending wait so the next poll is rescheduled on the new interval.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Rates and node-count thresholds for automatic adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Interval used until the cluster grows.
    #[serde(with = "crate::config::secs")]
    pub default_rate: Duration,
    /// Interval once the node count exceeds `reduced_threshold`.
    #[serde(with = "crate::config::secs")]
    pub reduced_rate: Duration,
    /// Interval once the node count exceeds `further_reduced_threshold`.
    #[serde(with = "crate::config::secs")]
    pub further_reduced_rate: Duration,
    /// First node-count threshold.
    pub reduced_threshold: usize,
    /// Second node-count threshold.
    pub further_reduced_threshold: usize,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            default_rate: Duration::from_secs(15),
            reduced_rate: Duration::from_secs(45),
            further_reduced_rate: Duration::from_secs(30),
            reduced_threshold: 25,
            further_reduced_threshold: 50,
        }
    }
}

#[derive(Debug)]
struct RateState {
    rate: Duration,
    overridden: bool,
}

/// How a wait for the next poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollWait {
    /// The interval elapsed without interruption.
    Elapsed,
    /// The rate changed at least once; the wait restarted on the new rate.
    Rescheduled,
}

/// Owns the current poll interval and the cancellable timer.
#[derive(Debug)]
pub struct PollRateController {
    policy: PollPolicy,
    state: Mutex<RateState>,
    changed: Notify,
}

impl PollRateController {
    /// Start at the policy's default rate with no override.
    #[must_use]
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            state: Mutex::new(RateState {
                rate: policy.default_rate,
                overridden: false,
            }),
            policy,
            changed: Notify::new(),
        }
    }

    /// The policy in effect.
    #[must_use]
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Current interval.
    #[must_use]
    pub fn rate(&self) -> Duration {
        self.state.lock().rate
    }

    /// Whether a manual override has latched.
    #[must_use]
    pub fn is_overridden(&self) -> bool {
        self.state.lock().overridden
    }

    /// Adopt a new interval.
    ///
    /// `is_override` latches the override flag permanently. When the rate
    /// actually changes, any pending wait is cancelled and restarted.
    /// A zero interval is ignored. Returns whether the rate changed.
    pub fn set_rate(&self, rate: Duration, is_override: bool) -> bool {
        if rate.is_zero() {
            warn!(is_override, "ignoring zero poll rate");
            return false;
        }

        let changed = {
            let mut state = self.state.lock();
            if is_override && !state.overridden {
                state.overridden = true;
            }
            if state.rate == rate {
                false
            } else {
                state.rate = rate;
                debug!(
                    rate_secs = rate.as_secs(),
                    overridden = state.overridden,
                    "poll rate changed"
                );
                true
            }
        };

        if changed {
            self.changed.notify_waiters();
        }
        changed
    }

    /// Apply the automatic tiers for the given node count.
    ///
    /// Does nothing once an override has latched, and never lowers the rate
    /// when the count shrinks. Returns whether the rate changed.
    pub fn auto_adjust(&self, node_count: usize) -> bool {
        if self.is_overridden() {
            return false;
        }

        if node_count > self.policy.reduced_threshold {
            self.set_rate(self.policy.reduced_rate, false)
        } else if node_count > self.policy.further_reduced_threshold {
            // Tested after the first tier, so with the default thresholds
            // this arm never fires.
            self.set_rate(self.policy.further_reduced_rate, false)
        } else {
            false
        }
    }

    /// Sleep for the current interval, restarting whenever the rate changes.
    pub async fn wait_next(&self) -> PollWait {
        let mut outcome = PollWait::Elapsed;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let rate = self.rate();
            tokio::select! {
                () = tokio::time::sleep(rate) => return outcome,
                () = &mut notified => outcome = PollWait::Rescheduled,
            }
        }
    }
}

impl Default for PollRateController {
    fn default() -> Self {
        Self::new(PollPolicy::default())
    }
}
