use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Background task that compacts the log once enough events piled up since
/// the last compaction. Runs until the task is dropped.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if compact_if_needed(&engine, threshold).await {
            info!("compactor ran (threshold {threshold})");
        }
    }
}

/// One compactor pass. Returns true if a compaction happened.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("compaction after {appends} appends failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::directory::InMemoryDirectory;
    use crate::limits::DAY_MS;
    use crate::model::NewSlot;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("carebook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(
            path,
            Arc::new(NotifyHub::new()),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(FixedClock::new(1_000 * DAY_MS)),
        )
        .unwrap();

        let sid = Ulid::new();
        let base = 1_001 * DAY_MS;
        for i in 0..3 {
            let start = base + i * 1_800_000;
            engine
                .create_slots(sid, vec![NewSlot::new(start, start + 1_800_000)])
                .await
                .unwrap();
        }

        assert!(!compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);
        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
