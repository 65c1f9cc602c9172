//! Configuration types.

use std::time::Duration;

/// Engine configuration.
///
/// These are deployment policy knobs, not invariants — the defaults
/// reproduce the reference policy and can be tuned per installation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an `acknowledged_by_worker` job may sit without an update
    /// before the stale reclaimer returns it to the queue.
    pub stale_timeout: Duration,
    /// Interval between sweeps of the spawned reclaim loop.
    pub reclaim_interval: Duration,
    /// Maximum number of queued jobs a worker acquires per poll.
    pub acquire_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            acquire_limit: 4,
        }
    }
}

/// History retention policy for the garbage collector.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Terminal jobs older than this are hard-deleted on every purge,
    /// regardless of the caller's `days_to_keep`. Caps storage growth.
    pub hard_delete_horizon_days: i64,
    /// Hard deletes run in batches of this many rows.
    pub delete_batch_size: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            hard_delete_horizon_days: 90,
            delete_batch_size: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retention_keeps_ninety_days() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.hard_delete_horizon_days, 90);
        assert!(policy.delete_batch_size > 0);
    }
}
