use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::observability::BACKGROUND_FAILURES_TOTAL;

/// How often the compactor checks the WAL append count.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Cancel pending holds whose expiry has passed, every `every`.
pub async fn run_lapse_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.sweep_lapsed_holds().await {
            Ok(0) => debug!("lapse sweep: nothing to expire"),
            Ok(n) => info!("lapse sweep expired {n} holds"),
            Err(e) => {
                metrics::counter!(BACKGROUND_FAILURES_TOTAL, "task" => "lapse_sweep").increment(1);
                error!("lapse sweep failed: {e}");
            }
        }
    }
}

/// Mark bookings whose end time has passed as completed, every `every`.
pub async fn run_completion_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.complete_past_bookings().await {
            Ok(0) => debug!("completion sweep: nothing to complete"),
            Ok(n) => info!("completion sweep completed {n} bookings"),
            Err(e) => {
                metrics::counter!(BACKGROUND_FAILURES_TOTAL, "task" => "completion_sweep")
                    .increment(1);
                error!("completion sweep failed: {e}");
            }
        }
    }
}

/// Rewrite the WAL once `threshold` events have been appended since the last
/// compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            metrics::counter!(BACKGROUND_FAILURES_TOTAL, "task" => "compaction").increment(1);
            error!("WAL compaction after {appends} appends failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::EngineSettings;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtside_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn lapse_sweeper_expires_holds_on_tick() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap().timestamp_millis();
        let clock = Arc::new(ManualClock::new(start));
        let engine = Arc::new(
            Engine::new(
                test_wal_path("lapse_tick.wal"),
                Arc::new(NotifyHub::new()),
                clock.clone(),
                EngineSettings::default(),
            )
            .unwrap(),
        );
        let court = Ulid::new();
        engine.create_court(court, Ulid::new(), "Court 1".into()).await.unwrap();

        let receipt = engine
            .initiate_booking(BookingRequest {
                id: Ulid::new(),
                court_id: court,
                date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                range: TimeRange::new(
                    NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
                )
                .unwrap(),
                holder: Holder::RegisteredUser(Ulid::new()),
                price_override: Some(50_000),
            })
            .await
            .unwrap();
        clock.advance(engine.settings().hold_ttl_ms);

        let task = tokio::spawn(run_lapse_sweeper(engine.clone(), Duration::from_millis(20)));
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let b = engine.get_booking(receipt.booking_id).await.unwrap();
            if b.status == BookingStatus::Cancelled {
                break;
            }
        }
        task.abort();

        let booking = engine.get_booking(receipt.booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);
        assert_eq!(booking.pending_expires_at, None);
    }
}
