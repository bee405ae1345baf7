use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};

pub const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Compact the tenant's WAL once enough appends have piled up since the last
/// rewrite. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await?;
    if appends < threshold {
        return Ok(false);
    }
    debug!("{appends} WAL appends since last compaction, compacting");
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task: check the WAL every `period` and compact past `threshold`.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("medslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn register_doctors(engine: &Engine, n: usize) {
        for i in 0..n {
            engine
                .register_doctor(Ulid::new(), format!("Dr. {i}"), "General".into())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let engine = Engine::new(test_wal_path("below.wal")).unwrap();
        register_doctors(&engine, 3).await;
        assert!(!compact_if_needed(&engine, 10).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn at_threshold_compacts() {
        let engine = Engine::new(test_wal_path("at.wal")).unwrap();
        register_doctors(&engine, 5).await;
        assert!(compact_if_needed(&engine, 5).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await.unwrap(), 0);
        assert_eq!(engine.list_doctors().len(), 5);
    }

    #[tokio::test]
    async fn background_task_compacts_on_schedule() {
        let engine = Arc::new(Engine::new(test_wal_path("task.wal")).unwrap());
        register_doctors(&engine, 4).await;

        let task = tokio::spawn(run_compactor(engine.clone(), 2, Duration::from_millis(20)));
        let mut compacted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if engine.wal_appends_since_compact().await.unwrap() == 0 {
                compacted = true;
                break;
            }
        }
        task.abort();
        assert!(compacted, "compactor never ran");
    }
}
