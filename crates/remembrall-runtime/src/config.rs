//! Runtime configuration.

use std::time::Duration;

use crate::batch::BatchConfig;
use crate::subs::SubsConfig;

/// Configuration for a [`Runtime`](crate::Runtime).
///
/// The defaults are tuned for an interactive client: a short coalescing
/// window on the fetch path, a few seconds of patience for slow relays, and
/// weekly retention pruned every ten minutes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on waiting for per-relay EOSE before the aggregate EOSE
    /// fires anyway.
    pub eose_timeout: Duration,

    /// Capacity of each subscription listener's channel.
    pub listener_capacity: usize,

    /// Debounce windows and flush bounds for batched lookups.
    pub batch: BatchConfig,

    /// How often the background pruner runs (when spawned).
    pub prune_interval: Duration,

    /// Events older than this are removed by the background pruner.
    pub prune_max_age: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            eose_timeout: Duration::from_secs(5),
            listener_capacity: 256,
            batch: BatchConfig::default(),
            prune_interval: Duration::from_secs(600),
            prune_max_age: Duration::from_secs(7 * 86400),
        }
    }
}

impl RuntimeConfig {
    /// The subscription manager's slice of this configuration.
    pub(crate) fn subs(&self) -> SubsConfig {
        SubsConfig {
            eose_timeout: self.eose_timeout,
            listener_capacity: self.listener_capacity,
        }
    }
}
