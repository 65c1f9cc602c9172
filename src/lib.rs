//! jobvault — durable background job lifecycle engine.
//!
//! Tracks long-running asynchronous tasks (model calls, transcription,
//! search, plan generation) in an embedded libsql database shared by any
//! number of worker processes. Jobs survive restarts; crashed workers'
//! leases are reclaimed; streamed output lands through race-safe
//! conditional updates. See `DESIGN.md` for the component map.

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod reconcile;
pub mod store;
pub mod time;

pub use config::{EngineConfig, RetentionPolicy};
pub use engine::JobEngine;
pub use engine::supervisor::spawn_reclaim_loop;
pub use error::{DatabaseError, Error, JobError, Result};
pub use job::{ApiType, Job, JobConfig, JobStatus, NewJob, StatusUpdate, TaskType};
pub use store::{JobStore, LibSqlBackend, PurgeStats, SessionJobFilter, StreamChunk};
