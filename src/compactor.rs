use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a course journal once it has grown by
/// `threshold` records since the last compaction. Exits when the engine is dropped.
pub async fn run_compactor(engine: Weak<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            debug!("compactor: engine gone, stopping");
            return;
        };
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether the journal was rewritten.
pub async fn compact_if_due(engine: &Arc<Engine>, threshold: u64) -> bool {
    let records = engine.records_since_compact().await;
    if records < threshold {
        return false;
    }
    match engine.compact_journal().await {
        Ok(()) => {
            info!("course {}: compacted after {records} records", engine.id);
            true
        }
        Err(e) => {
            warn!("course {}: compaction failed: {e}", engine.id);
            false
        }
    }
}
