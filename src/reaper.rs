use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Background task that cancels pending reservations older than `ttl`.
/// Opt-in policy: without a configured TTL this task is never spawned and
/// pending reservations hold their slot until someone decides otherwise.
pub async fn run_expirer(engine: Arc<Engine>, ttl: Ms) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let now = now_ms();
        let expired = engine.collect_expired_pending(now, ttl);
        for (reservation_id, _vehicle_id) in expired {
            match engine.cancel_reservation(reservation_id).await {
                Ok(()) => info!("expired pending reservation {reservation_id}"),
                Err(e) => {
                    // Raced with a payment callback or an admin — that's fine
                    tracing::debug!("expirer skip {reservation_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
