//! Incremental streamed-output updates.

use tracing::debug;
use uuid::Uuid;

use crate::engine::JobEngine;
use crate::error::{JobError, Result};
use crate::job::{Job, JobStatus};
use crate::store::{JobStore, StreamChunk};

impl JobEngine {
    /// Append a chunk of streamed output to a running job.
    ///
    /// Idempotently drops chunks for jobs that are no longer `running`:
    /// the pre-check catches most of them, and the store's status-guarded
    /// UPDATE catches a terminal transition that lands between the check
    /// and the write. Returns the updated job, or `None` when the chunk
    /// was dropped. Never an error in either case — late chunks after
    /// cancellation are an expected race, not a fault.
    pub async fn append_chunk(
        &self,
        job_id: Uuid,
        text: &str,
        tokens_in_chunk: u32,
        cumulative_chars: u64,
    ) -> Result<Option<Job>> {
        let job = self
            .store()
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        if job.status != JobStatus::Running {
            debug!(job_id = %job_id, status = %job.status, "Dropping chunk for non-running job");
            return Ok(None);
        }

        let chunk = StreamChunk {
            text: text.to_string(),
            tokens: tokens_in_chunk,
            cumulative_chars,
        };
        let applied = self.store().append_stream_chunk(job_id, &chunk).await?;
        if !applied {
            debug!(job_id = %job_id, "Chunk lost the race against a terminal transition");
            return Ok(None);
        }

        self.store().get_job(job_id).await
    }
}
