//! Recurrence expansion loop: periodically materializes concrete
//! bookings from active weekly rules, one engine per tenant.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ExpandPolicy;
use crate::engine::{Engine, now_ms};

pub async fn run_expander(engine: Arc<Engine>, policy: ExpandPolicy, every: Duration) {
    // First tick one full period after spawn, so a fresh tenant's rules
    // are not expanded out from under whoever just created them.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let created = engine.expand(now_ms(), policy.horizon_days).await;
        if created > 0 {
            info!("expansion materialized {created} booking(s)");
        } else {
            debug!("expansion found nothing to materialize");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use ulid::Ulid;

    #[tokio::test]
    async fn expander_loop_materializes_rules() {
        let dir = std::env::temp_dir().join("parkd_test_expander");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.wal", Ulid::new()));
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());

        let lot = Ulid::new();
        let slot = Ulid::new();
        engine.create_lot(lot, "Garage".into(), "1 Main St".into()).await.unwrap();
        engine.create_slot(slot, lot, "A1".into()).await.unwrap();
        engine
            .create_recurrence(Recurrence {
                id: Ulid::new(),
                user: "u1".into(),
                lot_id: lot,
                slot_id: slot,
                weekdays: WeekdaySet::from_days(&[0, 1, 2, 3, 4, 5, 6]),
                start_day: epoch_day(now_ms()) - 1,
                end_day: None,
                start_minute: 9 * 60,
                end_minute: 17 * 60,
                active: true,
            })
            .await
            .unwrap();

        let policy = ExpandPolicy { horizon_days: 3 };
        let handle = tokio::spawn(run_expander(
            engine.clone(),
            policy,
            Duration::from_millis(10),
        ));

        // Every day matches, so 4 bookings appear (today + 3 ahead).
        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.list_bookings(&lot).await.unwrap().len() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();

        assert_eq!(engine.list_bookings(&lot).await.unwrap().len(), 4);
    }
}
