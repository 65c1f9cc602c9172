//! Persistence layer: the `JobStore` trait and its libSQL backend.

mod libsql_backend;
pub mod migrations;
mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{JobStore, PurgeStats, SessionJobFilter, StreamChunk};
