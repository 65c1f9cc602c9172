//! History retention.

use tracing::info;

use crate::engine::JobEngine;
use crate::error::Result;
use crate::store::{JobStore, PurgeStats};

impl JobEngine {
    /// Prune terminal job history.
    ///
    /// `days_to_keep == -1` hard-deletes every terminal job. Any other
    /// value hard-deletes terminal jobs past the store's fixed horizon
    /// (90 days by default); `days_to_keep > 0` additionally soft-clears
    /// terminal jobs older than that many days, leaving them fetchable by
    /// id but hidden from listings. `0` keeps all recent history visible.
    ///
    /// Invoked by an operator-facing control; the engine never schedules
    /// it on its own.
    pub async fn purge_history(&self, days_to_keep: i64) -> Result<PurgeStats> {
        let stats = self.store().purge_history(days_to_keep).await?;
        if stats.deleted > 0 || stats.cleared > 0 {
            info!(
                days_to_keep,
                deleted = stats.deleted,
                cleared = stats.cleared,
                "Purged job history"
            );
        }
        Ok(stats)
    }

    /// Remove every job owned by a session. The owning application calls
    /// this when it deletes the session itself.
    pub async fn delete_session_jobs(&self, session_id: &str) -> Result<u64> {
        let removed = self.store().delete_session_jobs(session_id).await?;
        if removed > 0 {
            info!(session_id, removed, "Deleted session jobs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::engine::JobEngine;
    use crate::job::{ApiType, JobStatus, NewJob, StatusUpdate, TaskType};
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn purge_all_removes_finished_jobs_only() {
        let engine = JobEngine::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()));
        let done = engine
            .create_job(NewJob::new("s1", ApiType::Llm, TaskType::GenericStream, "p"))
            .await
            .unwrap();
        engine
            .update_status(
                done.id,
                JobStatus::Completed,
                StatusUpdate {
                    response: Some("out".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let pending = engine
            .create_job(NewJob::new("s1", ApiType::Llm, TaskType::GenericStream, "p"))
            .await
            .unwrap();

        let stats = engine.purge_history(-1).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(engine.get_job(done.id).await.unwrap().is_none());
        assert!(engine.get_job(pending.id).await.unwrap().is_some());
    }
}
