//! Job model and status state machine.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Substituted for the response of a completed job that recorded no output.
pub const FALLBACK_RESPONSE_TEXT: &str = "(no output recorded)";

/// Substituted for the error message of a failed or canceled job that
/// recorded none.
pub const FALLBACK_ERROR_TEXT: &str = "Unknown error";

/// Metadata keys the engine itself consumes. Anything else in the bag is
/// opaque pass-through for forward compatibility.
pub mod meta_keys {
    pub const TOKENS_SENT: &str = "tokensSent";
    pub const TOKENS_RECEIVED: &str = "tokensReceived";
    pub const TOKENS_TOTAL: &str = "tokensTotal";
    pub const CHARS_RECEIVED: &str = "charsReceived";
    pub const MODEL_USED: &str = "modelUsed";
    pub const MAX_OUTPUT_TOKENS: &str = "maxOutputTokens";
    pub const TEMPERATURE: &str = "temperature";
    pub const OUTPUT_FILE_PATH: &str = "outputFilePath";
    pub const ESTIMATED_COST: &str = "estimatedCost";
    pub const PRIORITY: &str = "priority";
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Default state for rows whose stored status is unrecognized.
    Idle,
    /// Created but not yet offered to workers.
    Created,
    /// Waiting to be acquired by a worker.
    Queued,
    /// A worker won the acquisition CAS but has not started yet.
    AcknowledgedByWorker,
    /// Worker is assembling inputs.
    Preparing,
    /// Worker is executing; streamed output may arrive.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Canceled before completion.
    Canceled,
}

/// All active (non-terminal) states, in worker-progress order.
pub const ACTIVE_STATUSES: [JobStatus; 6] = [
    JobStatus::Idle,
    JobStatus::Created,
    JobStatus::Queued,
    JobStatus::AcknowledgedByWorker,
    JobStatus::Preparing,
    JobStatus::Running,
];

/// All terminal states.
pub const TERMINAL_STATUSES: [JobStatus; 3] = [
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Canceled,
];

impl JobStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Transition legality table.
    ///
    /// Any active state may move to any other state (forward progress or
    /// finalization). Terminal states never transition — the engine treats
    /// terminal→terminal as a no-op and terminal→active as a rejected
    /// request, but neither passes this check.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // Any active state may progress anywhere, itself included —
            // a self-transition refreshes the update timestamps.
            (Idle | Created | Queued | AcknowledgedByWorker | Preparing | Running, _)
        )
    }

    /// Stable string form used in the store and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Created => "created",
            Self::Queued => "queued",
            Self::AcknowledgedByWorker => "acknowledged_by_worker",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    /// Tolerant parse: accepts the canonical snake_case spellings plus the
    /// legacy camelCase and British variants found in older databases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "acknowledged_by_worker" | "acknowledgedByWorker" => Ok(Self::AcknowledgedByWorker),
            "preparing" => Ok(Self::Preparing),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

/// Which backend family executes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    /// Remote model call (chat, transcription, search synthesis).
    #[default]
    Llm,
    /// Local work with no remote backend.
    Local,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm" => Ok(Self::Llm),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid api type: {s}")),
        }
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ImplementationPlan,
    PathFinder,
    VoiceTranscription,
    TextImprovement,
    WebSearch,
    GenericStream,
    Unknown,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImplementationPlan => "implementation_plan",
            Self::PathFinder => "path_finder",
            Self::VoiceTranscription => "voice_transcription",
            Self::TextImprovement => "text_improvement",
            Self::WebSearch => "web_search",
            Self::GenericStream => "generic_stream",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = std::convert::Infallible;

    /// Unrecognized task types map to `Unknown` so rows written by newer
    /// versions still load.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "implementation_plan" => Self::ImplementationPlan,
            "path_finder" => Self::PathFinder,
            "voice_transcription" => Self::VoiceTranscription,
            "text_improvement" => Self::TextImprovement,
            "web_search" => Self::WebSearch,
            "generic_stream" => Self::GenericStream,
            _ => Self::Unknown,
        })
    }
}

/// A single tracked unit of asynchronous work.
///
/// All timestamps are wall-clock milliseconds. Mutation goes through the
/// lifecycle engine, the streaming appender, or the acquisition CAS —
/// never by writing fields and re-saving from application code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub session_id: String,
    pub api_type: ApiType,
    pub task_type: TaskType,
    pub status: JobStatus,
    /// Immutable input payload, set at creation.
    pub prompt: String,
    /// Accumulated output. Empty string means "no output yet".
    pub response: String,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub tokens_sent: u32,
    pub tokens_received: u32,
    pub total_tokens: u32,
    pub chars_received: u64,
    pub model_used: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub include_syntax: bool,
    /// Accumulated cost, preserved across failure/cancellation.
    pub actual_cost: Option<Decimal>,
    /// Pointer to large output stored outside the row.
    pub output_file_path: Option<String>,
    pub project_directory: Option<String>,
    /// Soft-delete flag: still fetchable by id, hidden from listings.
    pub cleared: bool,
    pub visible: bool,
    /// Open string-keyed bag for non-schema-breaking extension fields.
    pub metadata: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_update: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl Job {
    /// Build a fresh job from a creation request. New jobs enter the queue
    /// immediately; `created_at == updated_at == last_update`.
    pub(crate) fn from_new(new: NewJob, now: i64) -> Self {
        let NewJob {
            session_id,
            api_type,
            task_type,
            prompt,
            config,
        } = new;

        let mut metadata = Map::new();
        // Mirror execution config into the bag so non-engine readers see it
        // without schema knowledge.
        if let Some(model) = &config.model {
            metadata.insert(meta_keys::MODEL_USED.into(), Value::from(model.clone()));
        }
        if let Some(max) = config.max_output_tokens {
            metadata.insert(meta_keys::MAX_OUTPUT_TOKENS.into(), Value::from(max));
        }
        if let Some(temp) = config.temperature {
            metadata.insert(meta_keys::TEMPERATURE.into(), Value::from(temp));
        }
        if let Some(priority) = config.priority {
            metadata.insert(meta_keys::PRIORITY.into(), Value::from(priority));
        }

        Self {
            id: Uuid::new_v4(),
            session_id,
            api_type,
            task_type,
            status: JobStatus::Queued,
            prompt,
            response: String::new(),
            status_message: None,
            error_message: None,
            tokens_sent: 0,
            tokens_received: 0,
            total_tokens: 0,
            chars_received: 0,
            model_used: config.model,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            include_syntax: config.include_syntax,
            actual_cost: None,
            output_file_path: None,
            project_directory: config.project_directory,
            cleared: false,
            visible: true,
            metadata,
            created_at: now,
            updated_at: now,
            last_update: now,
            start_time: None,
            end_time: None,
        }
    }
}

/// Execution configuration supplied at creation.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub include_syntax: bool,
    pub project_directory: Option<String>,
    /// Acquisition priority hint; higher is acquired first. Defaults to 1.
    pub priority: Option<i64>,
}

/// Request to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub session_id: String,
    pub api_type: ApiType,
    pub task_type: TaskType,
    pub prompt: String,
    pub config: JobConfig,
}

impl NewJob {
    pub fn new(
        session_id: impl Into<String>,
        api_type: ApiType,
        task_type: TaskType,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            api_type,
            task_type,
            prompt: prompt.into(),
            config: JobConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }
}

/// Optional fields accompanying a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub response: Option<String>,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    /// Shallow-merged over the job's existing metadata.
    pub metadata: Option<Map<String, Value>>,
}
