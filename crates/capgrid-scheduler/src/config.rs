//! Scheduler tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default wait for a cluster lock before an operation reports `Busy`.
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long an operation waits for its cluster lock when the caller
    /// supplies no deadline. `None` waits indefinitely.
    pub lock_timeout_ms: Option<u64>,
    /// How many times an admission pass is re-run after losing a
    /// compare-and-set race before the conflict is surfaced.
    pub conflict_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: Some(DEFAULT_LOCK_TIMEOUT_MS),
            conflict_retries: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}
