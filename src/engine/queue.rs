//! Queue acquisition and stale reclaim.

use std::time::Duration;

use tracing::{debug, info};

use crate::engine::JobEngine;
use crate::error::Result;
use crate::job::{Job, JobStatus};
use crate::store::JobStore;

impl JobEngine {
    /// Atomically acquire up to `limit` queued jobs for this worker.
    ///
    /// Candidates are taken in priority order (then FIFO) and claimed one
    /// by one with a conditional status swap, so a job is handed to at
    /// most one of any number of concurrent callers — across threads or
    /// processes. Jobs lost to a racing worker are skipped silently; the
    /// returned set is whatever this caller actually won.
    pub async fn acquire_queued(&self, limit: usize) -> Result<Vec<Job>> {
        let candidates = self.store().select_queued(limit).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut acquired = Vec::new();
        for candidate in candidates {
            let won = self
                .store()
                .compare_and_swap_status(
                    candidate.id,
                    JobStatus::Queued,
                    JobStatus::AcknowledgedByWorker,
                )
                .await?;

            if !won {
                debug!(job_id = %candidate.id, "Queued job taken by another worker");
                continue;
            }

            // Re-fetch so the caller sees the acknowledged state
            if let Some(job) = self.store().get_job(candidate.id).await? {
                acquired.push(job);
            }
        }

        if !acquired.is_empty() {
            debug!(count = acquired.len(), "Acquired queued jobs");
        }
        Ok(acquired)
    }

    /// Return acknowledged jobs whose worker went quiet for longer than
    /// `timeout` back to the queue. The update timestamp is the lease
    /// clock: any worker activity refreshes it.
    pub async fn reclaim_stale(&self, timeout: Duration) -> Result<u64> {
        let reclaimed = self.store().reclaim_stale(timeout).await?;
        if reclaimed > 0 {
            info!(count = reclaimed, timeout_secs = timeout.as_secs(), "Reclaimed stale jobs");
        }
        Ok(reclaimed)
    }
}
