//! The job engine façade.
//!
//! Wraps a shared [`JobStore`] and exposes the four collaborator
//! surfaces: producer (`create_job`, `update_status`, `append_chunk`),
//! supervisor (`acquire_queued`, `reclaim_stale`), presentation (the
//! read-only getters and listings) and retention (`purge_history`,
//! `delete_session_jobs`).

mod lifecycle;
mod queue;
mod retention;
mod streaming;
pub mod supervisor;

use std::sync::Arc;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::job::{ApiType, Job, NewJob, TaskType};
use crate::store::{JobStore, SessionJobFilter};

/// Orchestrates the job lifecycle over a shared store.
///
/// Cheap to clone; clones share the underlying store. Multiple engines in
/// separate processes over the same database file are equally safe — all
/// exclusion happens in the store's conditional updates.
#[derive(Clone)]
pub struct JobEngine {
    store: Arc<dyn JobStore>,
    config: EngineConfig,
}

impl JobEngine {
    /// Create an engine with default configuration.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn JobStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a job. Validation errors (empty session id) surface before
    /// any storage access.
    pub async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        self.store.create_job(new_job).await
    }

    // ── Presentation surface (read-only) ────────────────────────────

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    pub async fn list_visible_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.store.list_visible_jobs(limit).await
    }

    pub async fn list_jobs_by_session(
        &self,
        session_id: &str,
        filter: &SessionJobFilter,
    ) -> Result<Vec<Job>> {
        self.store.list_jobs_by_session(session_id, filter).await
    }

    pub async fn list_active_jobs_by_type(
        &self,
        task_type: Option<TaskType>,
        api_type: Option<ApiType>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        self.store
            .list_active_jobs_by_type(task_type, api_type, limit)
            .await
    }
}
