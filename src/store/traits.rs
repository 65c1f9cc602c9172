//! `JobStore` trait — the storage contract the engine is built on.
//!
//! Everything the engine needs from persistence lives here, including the
//! conditional-update primitives (acquisition CAS, guarded stream append,
//! stale reclaim) that carry the cross-worker exclusion guarantees. A
//! backend must implement those as single atomic statements against its
//! store; the engine adds no locking of its own.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::job::{ApiType, Job, JobStatus, NewJob, TaskType};

/// Filters for per-session job listings.
#[derive(Debug, Clone)]
pub struct SessionJobFilter {
    /// Restrict to these statuses; `None` means all.
    pub statuses: Option<Vec<JobStatus>>,
    /// Restrict to one task type.
    pub task_type: Option<TaskType>,
    /// Include soft-cleared jobs (excluded by default).
    pub include_cleared: bool,
    pub limit: usize,
}

impl Default for SessionJobFilter {
    fn default() -> Self {
        Self {
            statuses: None,
            task_type: None,
            include_cleared: false,
            limit: 100,
        }
    }
}

/// One increment of streamed output.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Text to append to the accumulated response.
    pub text: String,
    /// Tokens contained in this chunk.
    pub tokens: u32,
    /// Cumulative character length reported by the producer.
    pub cumulative_chars: u64,
}

/// Outcome of a purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Rows hard-deleted.
    pub deleted: u64,
    /// Rows soft-cleared.
    pub cleared: u64,
}

/// Backend-agnostic job persistence.
///
/// All reads pass through the row reconciler, so every returned [`Job`]
/// satisfies the lifecycle invariants regardless of what is on disk.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job with defaults and persist it.
    ///
    /// Rejects an empty or blank `session_id` with a validation error
    /// before touching storage.
    async fn create_job(&self, new_job: NewJob) -> Result<Job>;

    /// Idempotent upsert keyed by id. Returns the job as read back.
    async fn save_job(&self, job: &Job) -> Result<Job>;

    /// Fetch by id. Soft-cleared jobs are still returned.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Non-cleared jobs, active statuses first, then by status priority,
    /// then most recently updated.
    async fn list_visible_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    /// Jobs belonging to one session, newest first.
    async fn list_jobs_by_session(
        &self,
        session_id: &str,
        filter: &SessionJobFilter,
    ) -> Result<Vec<Job>>;

    /// Active (non-terminal) jobs, optionally narrowed by task and/or api
    /// type, oldest first.
    async fn list_active_jobs_by_type(
        &self,
        task_type: Option<TaskType>,
        api_type: Option<ApiType>,
        limit: usize,
    ) -> Result<Vec<Job>>;

    /// Atomic conditional status swap: one `UPDATE ... WHERE id = ? AND
    /// status = ?`. Returns whether this caller won. At most one concurrent
    /// caller can succeed for a given (id, expected) pair.
    async fn compare_and_swap_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<bool>;

    /// Queued jobs ordered by the `priority` metadata hint (descending,
    /// default 1) then creation time (FIFO within a priority).
    async fn select_queued(&self, limit: usize) -> Result<Vec<Job>>;

    /// Return every `acknowledged_by_worker` job whose last update is older
    /// than `timeout` to `queued`. Returns the reclaimed count.
    async fn reclaim_stale(&self, timeout: Duration) -> Result<u64>;

    /// Append a chunk to a running job in one guarded statement
    /// (`WHERE id = ? AND status = 'running'`). Returns false when the
    /// guard failed, i.e. a terminal transition won the race.
    async fn append_stream_chunk(&self, id: Uuid, chunk: &StreamChunk) -> Result<bool>;

    /// History retention pass. `days_to_keep == -1` deletes every terminal
    /// job; any other value hard-deletes terminal jobs past the fixed
    /// horizon; `days_to_keep > 0` additionally soft-clears terminal jobs
    /// older than that many days.
    async fn purge_history(&self, days_to_keep: i64) -> Result<PurgeStats>;

    /// Delete every job owned by a session. Called by the owning
    /// application when the session itself is deleted.
    async fn delete_session_jobs(&self, session_id: &str) -> Result<u64>;
}
