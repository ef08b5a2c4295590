use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::MemoryStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a business's WAL once enough events have
/// been appended since the last compaction.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// One compactor tick. Returns whether a compaction ran.
pub async fn compact_if_due(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!(
                "compacted WAL after {appends} appends ({} appointments)",
                store.appointment_count()
            );
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
