//! Background reclaim loop.
//!
//! The engine never schedules anything itself; deployments that want the
//! stale sweep wired up spawn this loop and hold the handle.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::JobEngine;

/// Spawn a loop that periodically returns stale acknowledged jobs to the
/// queue, using the engine's configured interval and lease timeout.
///
/// The first sweep runs immediately, which doubles as crash recovery:
/// jobs acknowledged by a worker that died before the restart go straight
/// back to `queued`.
pub fn spawn_reclaim_loop(engine: JobEngine) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = engine.config().reclaim_interval;
        let timeout = engine.config().stale_timeout;
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = timeout.as_secs(),
            "Stale reclaim loop started"
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(e) = engine.reclaim_stale(timeout).await {
                warn!(error = %e, "Stale reclaim sweep failed");
            }
        }
    })
}
