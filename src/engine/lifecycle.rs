//! Status transitions and terminal finalization.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::JobEngine;
use crate::error::{JobError, Result};
use crate::job::{
    FALLBACK_ERROR_TEXT, FALLBACK_RESPONSE_TEXT, Job, JobStatus, StatusUpdate, meta_keys,
};
use crate::store::JobStore;
use crate::time::now_millis;

impl JobEngine {
    /// Advance a job to `new_status`, applying the optional fields in
    /// `update`.
    ///
    /// Always stamps `updated_at`/`last_update`, even when the status is
    /// unchanged — callers watch those to detect "something happened".
    /// A job already in a terminal status is returned unchanged: a
    /// terminal→terminal request is a quiet no-op, a terminal→active
    /// request is rejected with a warning log. Neither raises; callers
    /// must re-derive state from the returned job rather than assume the
    /// request was honored.
    pub async fn update_status(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job> {
        let mut job = self
            .store()
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        if !job.status.can_transition_to(new_status) {
            if new_status.is_active() {
                warn!(
                    job_id = %job_id,
                    from = %job.status,
                    to = %new_status,
                    "Rejected transition out of terminal status"
                );
            } else {
                debug!(
                    job_id = %job_id,
                    from = %job.status,
                    to = %new_status,
                    "Job already terminal, transition is a no-op"
                );
            }
            return Ok(job);
        }

        let now = now_millis();
        job.updated_at = now;
        job.last_update = now;

        if new_status.is_terminal() {
            // Explicit end time wins, then whatever is already set, then now
            job.end_time = update.end_time.or(job.end_time).or(Some(now));

            match new_status {
                JobStatus::Completed => {
                    if let Some(response) = update.response {
                        job.response = response;
                    }
                    if job.response.is_empty() {
                        job.response = FALLBACK_RESPONSE_TEXT.to_string();
                    }
                    job.error_message = None;
                }
                JobStatus::Failed | JobStatus::Canceled => {
                    if let Some(message) = update.error_message {
                        job.error_message = Some(message);
                    }
                    if job.error_message.as_deref().map_or(true, str::is_empty) {
                        job.error_message = Some(FALLBACK_ERROR_TEXT.to_string());
                    }
                    // Without an explicit response the partial stream is
                    // discarded; pass one to keep it.
                    match update.response {
                        Some(response) => job.response = response,
                        None => job.response.clear(),
                    }
                }
                _ => unreachable!(),
            }
        } else {
            if let Some(start_time) = update.start_time {
                job.start_time = Some(start_time);
            }
            if new_status == JobStatus::Running && job.start_time.is_none() {
                job.start_time = Some(now);
            }
            if job.end_time.is_some() {
                warn!(job_id = %job_id, "Clearing end time on active job");
                job.end_time = None;
            }
            if let Some(response) = update.response {
                job.response = response;
            }
            if let Some(message) = update.error_message {
                job.error_message = if message.is_empty() {
                    None
                } else {
                    Some(message)
                };
            }
        }

        if let Some(message) = update.status_message {
            job.status_message = Some(message);
        }

        job.status = new_status;

        if let Some(patch) = update.metadata {
            // Shallow merge: top-level keys replace wholesale
            for (key, value) in patch {
                job.metadata.insert(key, value);
            }
        }
        promote_metadata(&mut job);

        debug!(job_id = %job_id, status = %new_status, "Job status updated");
        self.store().save_job(&job).await
    }

    /// Cancel a job. Cancelling an already-terminal job is a safe no-op.
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<Job> {
        self.update_status(
            job_id,
            JobStatus::Canceled,
            StatusUpdate {
                error_message: Some(reason.to_string()),
                ..Default::default()
            },
        )
        .await
    }
}

/// Copy engine-consumed metadata keys onto their first-class fields.
///
/// The bag keeps the values too, so non-engine readers see them without
/// schema knowledge.
fn promote_metadata(job: &mut Job) {
    let sent = job
        .metadata
        .get(meta_keys::TOKENS_SENT)
        .and_then(Value::as_u64);
    if let Some(v) = sent {
        job.tokens_sent = v as u32;
    }
    let received = job
        .metadata
        .get(meta_keys::TOKENS_RECEIVED)
        .and_then(Value::as_u64);
    if let Some(v) = received {
        job.tokens_received = v as u32;
    }
    match job
        .metadata
        .get(meta_keys::TOKENS_TOTAL)
        .and_then(Value::as_u64)
    {
        Some(total) => job.total_tokens = total as u32,
        None if sent.is_some() || received.is_some() => {
            job.total_tokens = job.tokens_sent + job.tokens_received;
        }
        None => {}
    }
    if let Some(v) = job
        .metadata
        .get(meta_keys::CHARS_RECEIVED)
        .and_then(Value::as_u64)
    {
        job.chars_received = v;
    }
    if let Some(v) = job.metadata.get(meta_keys::MODEL_USED).and_then(Value::as_str) {
        job.model_used = Some(v.to_string());
    }
    if let Some(v) = job
        .metadata
        .get(meta_keys::MAX_OUTPUT_TOKENS)
        .and_then(Value::as_u64)
    {
        job.max_output_tokens = u32::try_from(v).ok();
    }
    if let Some(v) = job
        .metadata
        .get(meta_keys::TEMPERATURE)
        .and_then(Value::as_f64)
    {
        job.temperature = Some(v as f32);
    }
    if let Some(v) = job
        .metadata
        .get(meta_keys::OUTPUT_FILE_PATH)
        .and_then(Value::as_str)
    {
        job.output_file_path = Some(v.to_string());
    }
    if let Some(cost) = job.metadata.get(meta_keys::ESTIMATED_COST).and_then(|v| {
        v.as_str()
            .map(str::to_string)
            .or_else(|| v.as_f64().map(|f| f.to_string()))
    }) {
        if let Ok(decimal) = Decimal::from_str(&cost) {
            job.actual_cost = Some(decimal);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rust_decimal_macros::dec;
    use serde_json::{Map, json};

    use super::*;
    use crate::error::Error;
    use crate::job::{ApiType, NewJob, TaskType};
    use crate::store::LibSqlBackend;

    async fn engine() -> JobEngine {
        JobEngine::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()))
    }

    fn new_job() -> NewJob {
        NewJob::new("session-1", ApiType::Llm, TaskType::GenericStream, "prompt")
    }

    #[tokio::test]
    async fn missing_job_raises_not_found() {
        let engine = engine().await;
        let err = engine
            .update_status(Uuid::new_v4(), JobStatus::Running, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn running_auto_sets_start_time() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        assert!(job.start_time.is_none());

        let job = engine
            .update_status(job.id, JobStatus::Running, StatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.start_time.is_some());
        assert!(job.end_time.is_none());
    }

    #[tokio::test]
    async fn completion_finalizes_response_and_clears_error() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        engine
            .update_status(
                job.id,
                JobStatus::Running,
                StatusUpdate {
                    error_message: Some("transient".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = engine
            .update_status(
                job.id,
                JobStatus::Completed,
                StatusUpdate {
                    response: Some("abcdef".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.response, "abcdef");
        assert!(job.error_message.is_none());
        assert!(job.end_time.is_some());
    }

    #[tokio::test]
    async fn completion_without_output_gets_placeholder() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        let job = engine
            .update_status(job.id, JobStatus::Completed, StatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(job.response, FALLBACK_RESPONSE_TEXT);
    }

    #[tokio::test]
    async fn failure_discards_partial_response_unless_supplied() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        engine
            .update_status(
                job.id,
                JobStatus::Running,
                StatusUpdate {
                    response: Some("partial stream".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let failed = engine
            .update_status(
                job.id,
                JobStatus::Failed,
                StatusUpdate {
                    error_message: Some("backend exploded".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.response, "");
        assert_eq!(failed.error_message.as_deref(), Some("backend exploded"));
        assert!(failed.end_time.is_some());
    }

    #[tokio::test]
    async fn failure_keeps_explicitly_supplied_partial_response() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        let failed = engine
            .update_status(
                job.id,
                JobStatus::Failed,
                StatusUpdate {
                    response: Some("kept partial".into()),
                    error_message: Some("timeout".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.response, "kept partial");
    }

    #[tokio::test]
    async fn failure_without_message_gets_placeholder() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        let failed = engine
            .update_status(job.id, JobStatus::Failed, StatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some(FALLBACK_ERROR_TEXT));
    }

    #[tokio::test]
    async fn terminal_jobs_never_reactivate() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        let done = engine
            .update_status(
                job.id,
                JobStatus::Completed,
                StatusUpdate {
                    response: Some("out".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for target in crate::job::ACTIVE_STATUSES {
            let unchanged = engine
                .update_status(job.id, target, StatusUpdate::default())
                .await
                .unwrap();
            assert_eq!(unchanged.status, JobStatus::Completed, "-> {target}");
            assert_eq!(unchanged.response, "out");
            assert_eq!(unchanged.end_time, done.end_time);
        }
    }

    #[tokio::test]
    async fn terminal_to_terminal_is_a_no_op() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        engine
            .update_status(
                job.id,
                JobStatus::Completed,
                StatusUpdate {
                    response: Some("out".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let unchanged = engine
            .update_status(job.id, JobStatus::Canceled, StatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(unchanged.status, JobStatus::Completed);
        assert_eq!(unchanged.response, "out");
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_safe() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        engine
            .update_status(job.id, JobStatus::Completed, StatusUpdate::default())
            .await
            .unwrap();

        let job = engine.cancel_job(job.id, "user clicked stop").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_active_job_records_reason() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        let job = engine.cancel_job(job.id, "user clicked stop").await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.error_message.as_deref(), Some("user clicked stop"));
        assert!(job.end_time.is_some());
    }

    #[tokio::test]
    async fn update_stamps_timestamps_even_without_status_change() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();

        // Cross a store-second boundary so the stamp is observable
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let job = engine
            .update_status(
                job.id,
                JobStatus::Queued,
                StatusUpdate {
                    status_message: Some("still waiting".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.updated_at > job.created_at);
        assert_eq!(job.updated_at, job.last_update);
        assert_eq!(job.status_message.as_deref(), Some("still waiting"));
    }

    #[tokio::test]
    async fn explicit_end_time_wins_over_now() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();
        let job = engine
            .update_status(
                job.id,
                JobStatus::Canceled,
                StatusUpdate {
                    end_time: Some(1_000_000),
                    error_message: Some("stop".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.end_time, Some(1_000_000));
    }

    #[tokio::test]
    async fn metadata_merges_shallow_and_promotes_known_keys() {
        let engine = engine().await;
        let job = engine
            .create_job(new_job().with_config(crate::job::JobConfig {
                model: Some("old-model".into()),
                ..Default::default()
            }))
            .await
            .unwrap();

        let mut patch = Map::new();
        patch.insert(meta_keys::TOKENS_SENT.into(), json!(10));
        patch.insert(meta_keys::TOKENS_RECEIVED.into(), json!(32));
        patch.insert(meta_keys::CHARS_RECEIVED.into(), json!(480));
        patch.insert(meta_keys::MODEL_USED.into(), json!("new-model"));
        patch.insert(meta_keys::OUTPUT_FILE_PATH.into(), json!("/tmp/plan.md"));
        patch.insert(meta_keys::ESTIMATED_COST.into(), json!("0.0125"));
        patch.insert("workflowStep".into(), json!("draft"));

        let job = engine
            .update_status(
                job.id,
                JobStatus::Running,
                StatusUpdate {
                    metadata: Some(patch),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(job.tokens_sent, 10);
        assert_eq!(job.tokens_received, 32);
        assert_eq!(job.total_tokens, 42);
        assert_eq!(job.chars_received, 480);
        assert_eq!(job.model_used.as_deref(), Some("new-model"));
        assert_eq!(job.output_file_path.as_deref(), Some("/tmp/plan.md"));
        assert_eq!(job.actual_cost, Some(dec!(0.0125)));
        // Unknown keys survive as opaque pass-through
        assert_eq!(job.metadata["workflowStep"], "draft");
        // The mirrored bag reflects the merged value
        assert_eq!(job.metadata[meta_keys::MODEL_USED], "new-model");
    }

    #[tokio::test]
    async fn explicit_tokens_total_is_adopted_verbatim() {
        let engine = engine().await;
        let job = engine.create_job(new_job()).await.unwrap();

        let mut patch = Map::new();
        patch.insert(meta_keys::TOKENS_TOTAL.into(), json!(99));
        let job = engine
            .update_status(
                job.id,
                JobStatus::Preparing,
                StatusUpdate {
                    metadata: Some(patch),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.total_tokens, 99);
    }
}
