//! Retry policy and per-task timeouts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff between load attempts of one Admin Task.
///
/// The first load (retry 0) is immediate. Retry `n` waits
/// `base_delay * multiplier^(n - 1)`.
///
/// Example with base_delay=2s, multiplier=2.0:
/// - retry 0 (first load): 0s
/// - retry 1: 2s
/// - retry 2: 4s
/// - retry 3: 8s
///
/// Every delay is capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay().as_secs_f64() * self.multiplier.powi(exponent);
        // NaN や桁あふれは上限に丸める
        Duration::try_from_secs_f64(delay_secs)
            .map_or(self.max_delay(), |delay| delay.min(self.max_delay()))
    }
}

/// Bounded waits of the election sub-protocol, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTimeouts {
    pub load_ms: u64,
    pub happy_ms: u64,
    pub ui_state_ms: u64,
    /// How long a lost elected component is held before the attempt aborts.
    pub hold_ms: u64,
    /// Interval of UI-state probes while holding.
    pub probe_interval_ms: u64,
    pub acknowledge_ms: u64,
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self {
            load_ms: 30_000,
            happy_ms: 60_000,
            ui_state_ms: 10_000,
            hold_ms: 60_000,
            probe_interval_ms: 10_000,
            acknowledge_ms: 10_000,
        }
    }
}

impl TaskTimeouts {
    pub fn load(&self) -> Duration {
        Duration::from_millis(self.load_ms)
    }

    pub fn happy(&self) -> Duration {
        Duration::from_millis(self.happy_ms)
    }

    pub fn ui_state(&self) -> Duration {
        Duration::from_millis(self.ui_state_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn acknowledge(&self) -> Duration {
        Duration::from_millis(self.acknowledge_ms)
    }
}
