//! Background maintenance loops: the auto-release sweep and WAL
//! compaction. Both run per tenant, spawned when the tenant's engine
//! comes up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ReleasePolicy;
use crate::engine::Engine;
use crate::engine::now_ms;

/// Periodically cancel no-show bookings and notify waitlists.
/// The policy is fixed at spawn time; changing it means restarting
/// the process.
pub async fn run_sweeper(engine: Arc<Engine>, policy: ReleasePolicy, every: Duration) {
    if !policy.is_active() {
        info!("auto-release disabled, sweeper not running");
        return;
    }
    // First tick one full period after spawn, not immediately.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let released = engine.sweep(now_ms(), &policy).await;
        if released > 0 {
            info!("sweep released {released} no-show booking(s)");
        } else {
            debug!("sweep found nothing to release");
        }
    }
}

/// Rewrite the WAL once enough appends have accumulated since the last
/// rewrite. Keeps restart replay time bounded.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let appends = engine.wal_appends_since_rewrite().await;
        if appends < threshold {
            continue;
        }
        debug!("compacting WAL after {appends} appends");
        if let Err(e) = engine.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use ulid::Ulid;

    fn test_engine() -> Arc<Engine> {
        let dir = std::env::temp_dir().join("parkd_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.wal", Ulid::new()));
        Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap())
    }

    #[tokio::test]
    async fn sweeper_loop_releases_overdue_bookings() {
        let engine = test_engine();
        let lot = Ulid::new();
        let slot = Ulid::new();
        engine.create_lot(lot, "Garage".into(), "1 Main St".into()).await.unwrap();
        engine.create_slot(slot, lot, "A1".into()).await.unwrap();

        // A booking that started over an hour ago, never checked in.
        let start = now_ms() - 60 * MINUTE_MS;
        let id = Ulid::new();
        engine
            .create_booking(
                id,
                lot,
                Some(slot),
                "u1".into(),
                Span::new(start, start + 8 * 60 * MINUTE_MS),
                BookingKind::OneOff,
            )
            .await
            .unwrap();

        let policy = ReleasePolicy { enabled: true, grace_minutes: 30 };
        let handle = tokio::spawn(run_sweeper(
            engine.clone(),
            policy,
            Duration::from_millis(10),
        ));

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(info) = engine.get_booking(&id).await
                    && info.cancelled == Some(CancelReason::AutoRelease)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn compactor_rewrites_past_threshold() {
        let engine = test_engine();
        let lot = Ulid::new();
        engine.create_lot(lot, "Garage".into(), "1 Main St".into()).await.unwrap();
        for i in 0..10 {
            engine.create_slot(Ulid::new(), lot, format!("A{i}")).await.unwrap();
        }
        assert!(engine.wal_appends_since_rewrite().await >= 11);

        let handle = tokio::spawn(run_compactor(engine.clone(), 5, Duration::from_millis(10)));
        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.wal_appends_since_rewrite().await != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();

        // State intact after the rewrite.
        assert_eq!(engine.list_slots(&lot).await.unwrap().len(), 10);
    }
}
