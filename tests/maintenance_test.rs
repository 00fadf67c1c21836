//! 维护调度器集成测试：生命周期、优先级、失败捕获、清理与备份

use market_data_hub::common::{now_millis, AssetClass, DataCategory, MaintenanceConfig, ShardConfig};
use market_data_hub::maintenance::{
    MaintenanceScheduler, OverallHealth, ShardOutcome, TaskParams, TaskPriority, TaskResult, TaskStatus, TaskTarget,
    TaskType,
};
use market_data_hub::shard::{BarRecord, ShardKeyClassifier, ShardManager};
use std::sync::Arc;
use std::time::Duration;

const DAY: i64 = 86_400_000;

fn seeded(dir: &std::path::Path) -> Arc<ShardManager> {
    let classifier = Arc::new(ShardKeyClassifier::new().unwrap());
    let manager = Arc::new(ShardManager::new(ShardConfig::with_root(dir), classifier).unwrap());
    let now = now_millis();

    // 每个分片一条过期数据和若干近期数据
    let crypto: Vec<BarRecord> = [now - 400 * DAY, now - DAY, now]
        .iter()
        .map(|ts| BarRecord::new("BTCUSDT", "binance", *ts, "1d").with_ohlcv(1.0, 2.0, 0.5, 1.5, 10.0))
        .collect();
    let us: Vec<BarRecord> = [now - 400 * DAY, now - 2 * DAY, now - DAY]
        .iter()
        .map(|ts| BarRecord::new("MSFT", "yfinance", *ts, "1d").with_ohlcv(1.0, 2.0, 0.5, 1.5, 10.0))
        .collect();
    manager.bulk_upsert(&crypto, AssetClass::Crypto, DataCategory::HistoricalBar, None).unwrap();
    manager.bulk_upsert(&us, AssetClass::EquityUs, DataCategory::HistoricalBar, None).unwrap();
    manager
}

fn scheduler(manager: Arc<ShardManager>, workers: usize) -> MaintenanceScheduler {
    let config = MaintenanceConfig { max_workers: workers, history_limit: 50 };
    MaintenanceScheduler::new(manager, &config)
}

#[tokio::test]
async fn test_health_check_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler(seeded(dir.path()), 2);

    let id = scheduler.submit(
        TaskType::HealthCheck,
        TaskTarget::All,
        TaskPriority::Normal,
        TaskParams::default().full_check(),
    );
    let pending = scheduler.get_task_status(&id).unwrap();
    assert_eq!(pending.status, TaskStatus::Pending);
    assert_eq!(scheduler.list_tasks().len(), 1);

    let done = scheduler.execute(&id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100.0);
    assert!(done.started_at.is_some() && done.completed_at.is_some());

    match done.result.unwrap() {
        TaskResult::HealthCheck(summary) => {
            assert_eq!(summary.shard_count, 2);
            assert_eq!(summary.total_records, 6);
            assert!(summary.shards.iter().all(|s| s.integrity_ok == Some(true)));
            assert_ne!(summary.status, OverallHealth::Poor);
        }
        other => panic!("unexpected result {:?}", other),
    }

    assert!(scheduler.list_tasks().is_empty());
    assert_eq!(scheduler.history().len(), 1);
    // 已结束的任务不能再次执行
    assert!(scheduler.execute(&id).await.is_err());
}

#[tokio::test]
async fn test_pending_tasks_dispatch_by_priority() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler(seeded(dir.path()), 1);

    let low = scheduler.submit(TaskType::Vacuum, TaskTarget::All, TaskPriority::Low, TaskParams::default());
    let critical = scheduler.submit(
        TaskType::StatisticsUpdate,
        TaskTarget::All,
        TaskPriority::Critical,
        TaskParams::default(),
    );
    let normal = scheduler.submit(TaskType::IntegrityCheck, TaskTarget::All, TaskPriority::Normal, TaskParams::default());

    let finished = scheduler.run_pending().await;
    let order: Vec<&str> = finished.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(order, vec![critical.as_str(), normal.as_str(), low.as_str()]);
    assert!(finished.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(finished[0].started_at <= finished[1].started_at);
    assert!(finished[1].started_at <= finished[2].started_at);

    let stats = scheduler.statistics();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.history_len, 3);
}

#[tokio::test]
async fn test_failed_task_captures_error() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler(seeded(dir.path()), 1);

    let id = scheduler.submit(
        TaskType::Vacuum,
        TaskTarget::Shard(AssetClass::Bond),
        TaskPriority::High,
        TaskParams::default(),
    );
    let failed = scheduler.execute(&id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.unwrap().contains("bond"));
    assert!(failed.result.is_none());
    assert_eq!(scheduler.statistics().failed, 1);
}

#[tokio::test]
async fn test_cleanup_removes_expired_rows() {
    let dir = tempfile::tempdir().unwrap();
    let manager = seeded(dir.path());
    let scheduler = scheduler(Arc::clone(&manager), 2);

    let id = scheduler.submit(
        TaskType::DataCleanup,
        TaskTarget::All,
        TaskPriority::Normal,
        TaskParams::default().with_retention_days(30),
    );
    let running = scheduler.spawn(&id);
    let done = scheduler.wait_for(&id, Duration::from_secs(30)).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    running.await.unwrap().unwrap();

    let deleted: usize = match done.result.unwrap() {
        TaskResult::PerShard(outcomes) => outcomes
            .iter()
            .map(|o| match o {
                ShardOutcome::Cleanup(report) => report.deleted["historical_bars"],
                other => panic!("unexpected outcome {:?}", other),
            })
            .sum(),
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(deleted, 2);
    assert_eq!(manager.get_statistics().unwrap().total_records, 4);
}

#[tokio::test]
async fn test_backup_task_writes_copy() {
    let dir = tempfile::tempdir().unwrap();
    let manager = seeded(dir.path());
    let scheduler = scheduler(Arc::clone(&manager), 1);

    let id = scheduler.submit(
        TaskType::Backup,
        TaskTarget::Shard(AssetClass::Crypto),
        TaskPriority::Normal,
        TaskParams::default(),
    );
    let done = scheduler.execute(&id).await.unwrap();
    let outcomes = match done.result.unwrap() {
        TaskResult::PerShard(outcomes) => outcomes,
        other => panic!("unexpected result {:?}", other),
    };
    match &outcomes[0] {
        ShardOutcome::Backup(report) => {
            assert!(report.backup_path.exists());
            assert!(report.size_bytes > 0);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    // 备份后分片可以继续使用
    assert_eq!(manager.get_statistics().unwrap().total_records, 6);
}

#[tokio::test]
async fn test_wait_for_times_out_on_pending_task() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler(seeded(dir.path()), 1);

    let id = scheduler.submit(TaskType::HealthCheck, TaskTarget::All, TaskPriority::Low, TaskParams::default());
    let err = scheduler.wait_for(&id, Duration::from_millis(50)).await.unwrap_err();
    assert!(err.is_retryable());

    let cancelled = scheduler.cancel(&id).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(scheduler.run_pending().await.is_empty());
}

#[test]
fn test_system_health_summary() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler(seeded(dir.path()), 1);

    let summary = scheduler.get_system_health_summary();
    assert_eq!(summary.shard_count, 2);
    assert_eq!(summary.total_records, 6);
    assert!(summary.average_score > 75.0);
    assert!(summary.shards.iter().all(|s| s.integrity_ok.is_none()));
}
