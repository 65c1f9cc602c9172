//! libSQL backend — async `JobStore` implementation.
//!
//! One write connection (all mutations, wrapped in transactions) and one
//! read connection (listings and fetches). Cross-worker exclusion is
//! carried entirely by conditional UPDATE statements; nothing here takes
//! an application-level lock.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetentionPolicy;
use crate::error::{DatabaseError, JobError, Result};
use crate::job::{ACTIVE_STATUSES, ApiType, Job, JobStatus, NewJob, TERMINAL_STATUSES, TaskType};
use crate::reconcile::{RawJob, reconcile_row};
use crate::store::migrations;
use crate::store::traits::{JobStore, PurgeStats, SessionJobFilter, StreamChunk};
use crate::time::{
    millis_to_store_secs, now_millis, opt_millis_to_store_secs, store_secs_to_millis,
};

/// libSQL job store.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    /// Write connection; every mutation goes through here.
    conn: Connection,
    /// Read connection, so listings don't queue behind writes.
    read_conn: Connection,
    retention: RetentionPolicy,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        let read_conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create read connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Job database opened");

        Ok(Self {
            db: Arc::new(db),
            conn,
            read_conn,
            retention: RetentionPolicy::default(),
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        // A second connect() to :memory: would open a different database;
        // share the handle instead.
        let read_conn = conn.clone();

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            read_conn,
            retention: RetentionPolicy::default(),
        })
    }

    /// Override the retention policy.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

// ── Helper functions ────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, session_id, api_type, task_type, status, prompt, response, \
     status_message, error_message, tokens_sent, tokens_received, total_tokens, chars_received, \
     model_used, max_output_tokens, temperature, include_syntax, actual_cost, output_file_path, \
     project_directory, cleared, metadata, created_at, updated_at, last_update, start_time, end_time";

fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> Value {
    match v {
        Some(v) => Value::Integer(v),
        None => Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> Value {
    match v {
        Some(v) => Value::Real(v),
        None => Value::Null,
    }
}

/// `'a', 'b', 'c'` list for interpolating trusted status constants.
fn status_in_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn query_err(context: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Query(format!("{context}: {e}"))
}

/// Map a libsql row (JOB_COLUMNS order) to a RawJob, converting store
/// seconds back to caller milliseconds. Nullable columns read through
/// `.ok()` so NULL surfaces as None.
fn row_to_raw(row: &libsql::Row) -> std::result::Result<RawJob, libsql::Error> {
    Ok(RawJob {
        id: row.get(0)?,
        session_id: row.get(1)?,
        api_type: row.get(2)?,
        task_type: row.get(3)?,
        status: row.get(4)?,
        prompt: row.get(5)?,
        response: row.get(6)?,
        status_message: row.get::<String>(7).ok(),
        error_message: row.get::<String>(8).ok(),
        tokens_sent: row.get(9)?,
        tokens_received: row.get(10)?,
        total_tokens: row.get(11)?,
        chars_received: row.get(12)?,
        model_used: row.get::<String>(13).ok(),
        max_output_tokens: row.get::<i64>(14).ok(),
        temperature: row.get::<f64>(15).ok(),
        include_syntax: row.get::<i64>(16)? != 0,
        actual_cost: row.get::<String>(17).ok(),
        output_file_path: row.get::<String>(18).ok(),
        project_directory: row.get::<String>(19).ok(),
        cleared: row.get::<i64>(20)? != 0,
        metadata: row.get::<String>(21).ok(),
        created_at: store_secs_to_millis(row.get(22)?),
        updated_at: store_secs_to_millis(row.get(23)?),
        last_update: store_secs_to_millis(row.get(24)?),
        start_time: row.get::<i64>(25).ok().map(store_secs_to_millis),
        end_time: row.get::<i64>(26).ok().map(store_secs_to_millis),
    })
}

/// Reconcile a raw row into a valid Job, logging any repairs.
fn map_row(row: &libsql::Row) -> std::result::Result<Job, libsql::Error> {
    let raw = row_to_raw(row)?;
    let (job, repairs) = reconcile_row(raw);
    for repair in &repairs {
        warn!(job_id = %job.id, repair = %repair, "Repaired job row on read");
    }
    Ok(job)
}

async fn collect_jobs(mut rows: libsql::Rows) -> Vec<Job> {
    let mut jobs = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match map_row(&row) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping job row: {e}"),
        }
    }
    jobs
}

/// Whether a libsql error is SQLite write contention.
fn is_busy(e: &libsql::Error) -> bool {
    let msg = e.to_string();
    msg.contains("database is locked") || msg.contains("busy")
}

/// Execute a single write with bounded backoff on `database is locked`.
async fn execute_with_retry(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> std::result::Result<u64, libsql::Error> {
    let mut last_error = None;
    for attempt in 0..5u32 {
        match conn.execute(sql, values.clone()).await {
            Ok(affected) => return Ok(affected),
            Err(e) if is_busy(&e) => {
                let backoff = 25u64 * (1u64 << attempt);
                let jitter = rand::thread_rng().gen_range(0..25u64);
                last_error = Some(e);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.expect("retry loop exits with an error"))
}

/// Full positional parameter list for the jobs upsert, in JOB_COLUMNS
/// order. Timestamps go down in store seconds.
fn job_write_values(job: &Job, metadata_json: String) -> Vec<Value> {
    vec![
        text(job.id.to_string()),
        text(job.session_id.clone()),
        text(job.api_type.as_str()),
        text(job.task_type.as_str()),
        text(job.status.as_str()),
        text(job.prompt.clone()),
        text(job.response.clone()),
        opt_text(job.status_message.as_deref()),
        opt_text(job.error_message.as_deref()),
        Value::Integer(job.tokens_sent as i64),
        Value::Integer(job.tokens_received as i64),
        Value::Integer(job.total_tokens as i64),
        Value::Integer(job.chars_received as i64),
        opt_text(job.model_used.as_deref()),
        opt_int(job.max_output_tokens.map(|v| v as i64)),
        opt_real(job.temperature.map(|v| v as f64)),
        Value::Integer(job.include_syntax as i64),
        opt_text(job.actual_cost.map(|c| c.to_string()).as_deref()),
        opt_text(job.output_file_path.as_deref()),
        opt_text(job.project_directory.as_deref()),
        Value::Integer(job.cleared as i64),
        text(metadata_json),
        Value::Integer(millis_to_store_secs(job.created_at)),
        Value::Integer(millis_to_store_secs(job.updated_at)),
        Value::Integer(millis_to_store_secs(job.last_update)),
        opt_int(opt_millis_to_store_secs(job.start_time)),
        opt_int(opt_millis_to_store_secs(job.end_time)),
    ]
}

const UPSERT_JOB_SQL: &str = "INSERT INTO jobs (id, session_id, api_type, task_type, status, prompt, response, \
     status_message, error_message, tokens_sent, tokens_received, total_tokens, chars_received, \
     model_used, max_output_tokens, temperature, include_syntax, actual_cost, output_file_path, \
     project_directory, cleared, metadata, created_at, updated_at, last_update, start_time, end_time) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, \
             ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27) \
     ON CONFLICT (id) DO UPDATE SET \
        session_id = excluded.session_id, \
        api_type = excluded.api_type, \
        task_type = excluded.task_type, \
        status = excluded.status, \
        prompt = excluded.prompt, \
        response = excluded.response, \
        status_message = excluded.status_message, \
        error_message = excluded.error_message, \
        tokens_sent = excluded.tokens_sent, \
        tokens_received = excluded.tokens_received, \
        total_tokens = excluded.total_tokens, \
        chars_received = excluded.chars_received, \
        model_used = excluded.model_used, \
        max_output_tokens = excluded.max_output_tokens, \
        temperature = excluded.temperature, \
        include_syntax = excluded.include_syntax, \
        actual_cost = excluded.actual_cost, \
        output_file_path = excluded.output_file_path, \
        project_directory = excluded.project_directory, \
        cleared = excluded.cleared, \
        metadata = excluded.metadata, \
        created_at = excluded.created_at, \
        updated_at = excluded.updated_at, \
        last_update = excluded.last_update, \
        start_time = excluded.start_time, \
        end_time = excluded.end_time";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        if new_job.session_id.trim().is_empty() {
            return Err(JobError::InvalidSession {
                reason: "session id must not be empty".into(),
            }
            .into());
        }

        let job = Job::from_new(new_job, now_millis());
        debug!(job_id = %job.id, session_id = %job.session_id, task_type = %job.task_type, "Creating job");
        self.save_job(&job).await
    }

    async fn save_job(&self, job: &Job) -> Result<Job> {
        let metadata_json =
            serde_json::to_string(&serde_json::Value::Object(job.metadata.clone()))
                .map_err(|e| DatabaseError::Serialization(format!("job metadata: {e}")))?;
        let values = job_write_values(job, metadata_json);

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| query_err("save_job: begin", e))?;
        tx.execute(UPSERT_JOB_SQL, values)
            .await
            .map_err(|e| query_err("save_job", e))?;
        tx.commit()
            .await
            .map_err(|e| query_err("save_job: commit", e))?;

        self.get_job(job.id).await?.ok_or_else(|| {
            DatabaseError::Query(format!("save_job: job {} vanished after write", job.id)).into()
        })
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let mut rows = self
            .read_conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("get_job", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = map_row(&row).map_err(|e| query_err("get_job: row parse", e))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("get_job: next", e).into()),
        }
    }

    async fn list_visible_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let rows = self
            .read_conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE cleared = 0 \
                     ORDER BY CASE status \
                        WHEN 'running' THEN 0 \
                        WHEN 'preparing' THEN 1 \
                        WHEN 'acknowledged_by_worker' THEN 2 \
                        WHEN 'queued' THEN 3 \
                        WHEN 'created' THEN 4 \
                        WHEN 'idle' THEN 5 \
                        WHEN 'completed' THEN 6 \
                        WHEN 'failed' THEN 7 \
                        WHEN 'canceled' THEN 8 \
                        ELSE 9 END, \
                     updated_at DESC \
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| query_err("list_visible_jobs", e))?;

        Ok(collect_jobs(rows).await)
    }

    async fn list_jobs_by_session(
        &self,
        session_id: &str,
        filter: &SessionJobFilter,
    ) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE session_id = ?1");
        if !filter.include_cleared {
            sql.push_str(" AND cleared = 0");
        }
        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(" AND status IN ({})", status_in_list(statuses)));
        }
        if let Some(task_type) = filter.task_type {
            sql.push_str(&format!(" AND task_type = '{}'", task_type.as_str()));
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT ?2");

        let rows = self
            .read_conn
            .query(&sql, params![session_id, filter.limit as i64])
            .await
            .map_err(|e| query_err("list_jobs_by_session", e))?;

        Ok(collect_jobs(rows).await)
    }

    async fn list_active_jobs_by_type(
        &self,
        task_type: Option<TaskType>,
        api_type: Option<ApiType>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let mut sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE cleared = 0 AND status IN ({})",
            status_in_list(&ACTIVE_STATUSES)
        );
        if let Some(task_type) = task_type {
            sql.push_str(&format!(" AND task_type = '{}'", task_type.as_str()));
        }
        if let Some(api_type) = api_type {
            sql.push_str(&format!(" AND api_type = '{}'", api_type.as_str()));
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT ?1");

        let rows = self
            .read_conn
            .query(&sql, params![limit as i64])
            .await
            .map_err(|e| query_err("list_active_jobs_by_type", e))?;

        Ok(collect_jobs(rows).await)
    }

    async fn compare_and_swap_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<bool> {
        let now_s = millis_to_store_secs(now_millis());
        let affected = execute_with_retry(
            &self.conn,
            "UPDATE jobs SET status = ?1, updated_at = ?2, last_update = ?2 \
             WHERE id = ?3 AND status = ?4",
            vec![
                text(next.as_str()),
                Value::Integer(now_s),
                text(id.to_string()),
                text(expected.as_str()),
            ],
        )
        .await
        .map_err(|e| query_err("compare_and_swap_status", e))?;

        Ok(affected == 1)
    }

    async fn select_queued(&self, limit: usize) -> Result<Vec<Job>> {
        let rows = self
            .read_conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE status = 'queued' AND cleared = 0 \
                     ORDER BY COALESCE(json_extract(metadata, '$.priority'), 1) DESC, \
                              created_at ASC \
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| query_err("select_queued", e))?;

        Ok(collect_jobs(rows).await)
    }

    async fn reclaim_stale(&self, timeout: Duration) -> Result<u64> {
        let now_s = millis_to_store_secs(now_millis());
        let affected = execute_with_retry(
            &self.conn,
            "UPDATE jobs SET status = 'queued', updated_at = ?1, last_update = ?1 \
             WHERE status = 'acknowledged_by_worker' AND (?1 - updated_at) > ?2",
            vec![
                Value::Integer(now_s),
                Value::Integer(timeout.as_secs() as i64),
            ],
        )
        .await
        .map_err(|e| query_err("reclaim_stale", e))?;

        Ok(affected)
    }

    async fn append_stream_chunk(&self, id: Uuid, chunk: &StreamChunk) -> Result<bool> {
        let now_s = millis_to_store_secs(now_millis());
        // Guarded by status so a terminal transition that raced ahead wins;
        // a late chunk must never resurrect output on a finished job.
        let affected = execute_with_retry(
            &self.conn,
            "UPDATE jobs SET \
                response = response || ?1, \
                tokens_received = tokens_received + ?2, \
                chars_received = ?3, \
                total_tokens = tokens_sent + tokens_received + ?2, \
                updated_at = ?4, last_update = ?4 \
             WHERE id = ?5 AND status = 'running'",
            vec![
                text(chunk.text.clone()),
                Value::Integer(chunk.tokens as i64),
                Value::Integer(chunk.cumulative_chars as i64),
                Value::Integer(now_s),
                text(id.to_string()),
            ],
        )
        .await
        .map_err(|e| query_err("append_stream_chunk", e))?;

        Ok(affected == 1)
    }

    async fn purge_history(&self, days_to_keep: i64) -> Result<PurgeStats> {
        let terminal = status_in_list(&TERMINAL_STATUSES);
        let now_s = millis_to_store_secs(now_millis());
        let mut stats = PurgeStats::default();

        if days_to_keep == -1 {
            stats.deleted = self
                .conn
                .execute(
                    &format!("DELETE FROM jobs WHERE status IN ({terminal})"),
                    (),
                )
                .await
                .map_err(|e| query_err("purge_history: delete all", e))?;
            return Ok(stats);
        }

        // The hard horizon applies no matter what the caller asked for;
        // batched so a years-old backlog can't pin the write connection.
        let horizon_cutoff =
            now_s - self.retention.hard_delete_horizon_days.saturating_mul(86_400);
        let batch = self.retention.delete_batch_size;
        loop {
            let affected = self
                .conn
                .execute(
                    &format!(
                        "DELETE FROM jobs WHERE id IN (\
                            SELECT id FROM jobs \
                            WHERE status IN ({terminal}) AND created_at < ?1 \
                            LIMIT ?2)"
                    ),
                    params![horizon_cutoff, batch as i64],
                )
                .await
                .map_err(|e| query_err("purge_history: horizon delete", e))?;
            stats.deleted += affected;
            if (affected as usize) < batch {
                break;
            }
        }

        if days_to_keep > 0 {
            let clear_cutoff = now_s - days_to_keep.saturating_mul(86_400);
            stats.cleared = self
                .conn
                .execute(
                    &format!(
                        "UPDATE jobs SET cleared = 1 \
                         WHERE status IN ({terminal}) AND created_at < ?1 AND cleared = 0"
                    ),
                    params![clear_cutoff],
                )
                .await
                .map_err(|e| query_err("purge_history: soft clear", e))?;
        }

        Ok(stats)
    }

    async fn delete_session_jobs(&self, session_id: &str) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| query_err("delete_session_jobs", e))?;
        Ok(affected)
    }
}
