//! Repair-on-read: reconstructs a valid [`Job`] from a raw persisted row.
//!
//! The store can accumulate rows that violate the lifecycle invariants —
//! a crash between two writes, a legacy writer, a bad migration. The read
//! path never surfaces those as errors: every corruption class has a
//! deterministic repair, applied here as a pure function. The storage
//! mapper logs each returned [`Repair`] at warn level.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::job::{ApiType, FALLBACK_ERROR_TEXT, FALLBACK_RESPONSE_TEXT, Job, JobStatus, TaskType};

/// A job row as read from the store, after unit conversion (timestamps in
/// milliseconds) but before any validation.
#[derive(Debug, Clone)]
pub struct RawJob {
    pub id: String,
    pub session_id: String,
    pub api_type: String,
    pub task_type: String,
    pub status: String,
    pub prompt: String,
    pub response: String,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub tokens_sent: i64,
    pub tokens_received: i64,
    pub total_tokens: i64,
    pub chars_received: i64,
    pub model_used: Option<String>,
    pub max_output_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub include_syntax: bool,
    pub actual_cost: Option<String>,
    pub output_file_path: Option<String>,
    pub project_directory: Option<String>,
    pub cleared: bool,
    pub metadata: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_update: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

/// A correction applied while reconciling a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// Stored status string was unrecognized; defaulted to `idle`.
    UnknownStatus { found: String },
    /// A `running` row carried an end time; reclassified as terminal.
    RunningReclassified { to: JobStatus },
    /// Terminal row without an end time; backfilled from the latest
    /// available timestamp.
    BackfilledEndTime { end_time: i64 },
    /// Active row carried an end time; cleared it.
    ClearedEndTime,
    /// Completed row with an empty response; substituted the placeholder.
    FilledResponsePlaceholder,
    /// Failed/canceled row without an error message; substituted the
    /// placeholder.
    FilledErrorPlaceholder,
    /// Completed row carried a stale error message; cleared it.
    ClearedErrorMessage,
    /// Running row without a start time; backfilled from the last update.
    BackfilledStartTime { start_time: i64 },
}

impl std::fmt::Display for Repair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownStatus { found } => write!(f, "unknown status '{found}' -> idle"),
            Self::RunningReclassified { to } => write!(f, "running with end time -> {to}"),
            Self::BackfilledEndTime { end_time } => write!(f, "backfilled end time {end_time}"),
            Self::ClearedEndTime => write!(f, "cleared end time on active job"),
            Self::FilledResponsePlaceholder => write!(f, "filled placeholder response"),
            Self::FilledErrorPlaceholder => write!(f, "filled placeholder error message"),
            Self::ClearedErrorMessage => write!(f, "cleared error message on completed job"),
            Self::BackfilledStartTime { start_time } => {
                write!(f, "backfilled start time {start_time}")
            }
        }
    }
}

/// Reconcile a raw row into a structurally valid [`Job`].
///
/// Never fails: every violation maps to a repair, and the returned job
/// satisfies the lifecycle invariants.
pub fn reconcile_row(raw: RawJob) -> (Job, Vec<Repair>) {
    let mut repairs = Vec::new();

    let mut status = match JobStatus::from_str(&raw.status) {
        Ok(s) => s,
        Err(_) => {
            repairs.push(Repair::UnknownStatus {
                found: raw.status.clone(),
            });
            JobStatus::Idle
        }
    };

    let mut response = raw.response;
    let mut error_message = normalize_text(raw.error_message);
    let mut start_time = raw.start_time;
    let mut end_time = raw.end_time;

    // A running job with an end time was interrupted mid-finalization.
    // Decide its fate from whether any output made it down.
    if status == JobStatus::Running && end_time.is_some() {
        status = if response.is_empty() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        repairs.push(Repair::RunningReclassified { to: status });
    }

    if status.is_terminal() {
        if end_time.is_none() {
            let backfilled =
                latest_timestamp(raw.created_at, raw.updated_at, raw.last_update, start_time);
            end_time = Some(backfilled);
            repairs.push(Repair::BackfilledEndTime {
                end_time: backfilled,
            });
        }
        match status {
            JobStatus::Completed => {
                if response.is_empty() {
                    response = FALLBACK_RESPONSE_TEXT.to_string();
                    repairs.push(Repair::FilledResponsePlaceholder);
                }
                if error_message.is_some() {
                    error_message = None;
                    repairs.push(Repair::ClearedErrorMessage);
                }
            }
            JobStatus::Failed | JobStatus::Canceled => {
                if error_message.is_none() {
                    error_message = Some(FALLBACK_ERROR_TEXT.to_string());
                    repairs.push(Repair::FilledErrorPlaceholder);
                }
            }
            _ => unreachable!(),
        }
    } else if end_time.is_some() {
        end_time = None;
        repairs.push(Repair::ClearedEndTime);
    }

    // Running implies a start time; a row that skipped the engine's
    // stamping gets the last update as a best effort.
    if status == JobStatus::Running && start_time.is_none() {
        start_time = Some(raw.updated_at);
        repairs.push(Repair::BackfilledStartTime {
            start_time: raw.updated_at,
        });
    }

    let job = Job {
        id: Uuid::parse_str(&raw.id).unwrap_or_else(|_| Uuid::nil()),
        session_id: raw.session_id,
        api_type: ApiType::from_str(&raw.api_type).unwrap_or_default(),
        task_type: TaskType::from_str(&raw.task_type).unwrap_or(TaskType::Unknown),
        status,
        prompt: raw.prompt,
        response,
        status_message: normalize_text(raw.status_message),
        error_message,
        tokens_sent: clamp_counter(raw.tokens_sent),
        tokens_received: clamp_counter(raw.tokens_received),
        total_tokens: clamp_counter(raw.total_tokens),
        chars_received: raw.chars_received.max(0) as u64,
        model_used: normalize_text(raw.model_used),
        max_output_tokens: raw.max_output_tokens.and_then(|v| u32::try_from(v).ok()),
        temperature: raw.temperature.map(|t| t as f32),
        include_syntax: raw.include_syntax,
        actual_cost: raw
            .actual_cost
            .as_deref()
            .and_then(|s| Decimal::from_str(s).ok()),
        output_file_path: normalize_text(raw.output_file_path),
        project_directory: normalize_text(raw.project_directory),
        cleared: raw.cleared,
        visible: true,
        metadata: parse_metadata(raw.metadata.as_deref()),
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        last_update: raw.last_update,
        start_time,
        end_time,
    };

    (job, repairs)
}

/// Latest timestamp available on the row, for end-time backfill.
fn latest_timestamp(
    created_at: i64,
    updated_at: i64,
    last_update: i64,
    start_time: Option<i64>,
) -> i64 {
    created_at
        .max(updated_at)
        .max(last_update)
        .max(start_time.unwrap_or(i64::MIN))
}

/// Treat empty strings as absent.
fn normalize_text(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

fn clamp_counter(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

fn parse_metadata(raw: Option<&str>) -> Map<String, Value> {
    raw.and_then(|s| serde_json::from_str::<Value>(s).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}
