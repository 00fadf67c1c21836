//! 分片管理器集成测试：建库幂等、写入回读、视图、目录合并、连接池、备份恢复

use market_data_hub::common::{AppError, AssetClass, DataCategory, ShardConfig};
use market_data_hub::shard::schema::{count_objects, BASE_TABLES};
use market_data_hub::shard::{BarRecord, CatalogRecord, GenericRecord, ShardKeyClassifier, ShardManager};
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use std::time::Duration;

fn manager_with(config: ShardConfig) -> ShardManager {
    let classifier = Arc::new(ShardKeyClassifier::new().unwrap());
    ShardManager::new(config, classifier).unwrap()
}

fn bars(symbol: &str, source: &str, count: i64) -> Vec<BarRecord> {
    (0..count)
        .map(|i| {
            let base = 10.0 + i as f64;
            BarRecord::new(symbol, source, 1_700_000_000_000 + i * 86_400_000, "1d")
                .with_ohlcv(base, base + 1.0, base - 1.0, base + 0.5, 1000.0 + i as f64)
        })
        .collect()
}

fn bar_count(manager: &ShardManager, class: AssetClass) -> i64 {
    let conn = manager.acquire_connection(class).unwrap();
    conn.query_row("SELECT COUNT(*) FROM historical_bars", [], |r| r.get(0)).unwrap()
}

#[test]
fn test_shard_creation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));

    let first = manager.get_or_create_shard(AssetClass::Crypto).unwrap();
    let second = manager.get_or_create_shard(AssetClass::Crypto).unwrap();
    assert_eq!(first, second);
    assert!(first.ends_with("crypto.db"));

    // 关闭后重新打开，已有数据与结构保持不变
    manager.bulk_upsert(&bars("BTCUSDT", "binance", 3), AssetClass::Crypto, DataCategory::HistoricalBar, None).unwrap();
    manager.close_pool(AssetClass::Crypto);
    manager.get_or_create_shard(AssetClass::Crypto).unwrap();

    let conn = manager.acquire_connection(AssetClass::Crypto).unwrap();
    assert_eq!(count_objects(&conn, "table").unwrap(), BASE_TABLES.len() as i64 + 1);
    assert_eq!(count_objects(&conn, "view").unwrap(), 2);
    drop(conn);
    assert_eq!(bar_count(&manager, AssetClass::Crypto), 3);

    let handle = manager.shard_handle(AssetClass::Crypto).unwrap();
    assert_eq!(handle.file_path, first);
}

#[test]
fn test_alias_classes_share_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));

    let concept = manager.get_or_create_shard(AssetClass::Concept).unwrap();
    let industry = manager.get_or_create_shard(AssetClass::Industry).unwrap();
    assert_eq!(concept, industry);
    assert_eq!(concept, manager.shard_path(AssetClass::Sector));
    assert_eq!(manager.known_shards(), vec![AssetClass::Sector]);
}

#[test]
fn test_upsert_round_trip_and_conflict_update() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));
    let class = manager.shard_for_symbol("600519.SH");
    assert_eq!(class, AssetClass::EquityDomestic);

    let written = manager
        .bulk_upsert(&bars("600519.SH", "tushare", 5), class, DataCategory::HistoricalBar, None)
        .unwrap();
    assert_eq!(written, 5);

    let stamps = |manager: &ShardManager| -> (f64, i64, i64) {
        let conn = manager.acquire_connection(class).unwrap();
        conn.query_row(
            "SELECT close, created_at, updated_at FROM historical_bars WHERE symbol = ?1 ORDER BY timestamp LIMIT 1",
            ["600519.SH"],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap()
    };
    let (_, created_before, updated_before) = stamps(&manager);
    assert_eq!(created_before, updated_before);
    std::thread::sleep(Duration::from_millis(5));

    // 相同主键再次写入只更新，不新增
    let mut updated = bars("600519.SH", "tushare", 2);
    updated[0].close = Some(99.0);
    manager.bulk_upsert(&updated, class, DataCategory::HistoricalBar, None).unwrap();
    assert_eq!(bar_count(&manager, class), 5);

    let (close, created_after, updated_after) = stamps(&manager);
    assert_eq!(close, 99.0);
    assert_eq!(created_after, created_before);
    assert!(updated_after > updated_before);

    let handle = manager.shard_handle(class).unwrap();
    assert!(handle.known_data_sources.contains("tushare"));
}

#[test]
fn test_generic_rows_with_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));

    let rows = vec![GenericRecord::new()
        .set("code", "AAPL")
        .set("source", "yfinance")
        .set("datetime", "2024-01-02")
        .set("frequency", "1d")
        .set("close", 185.6)
        .set("vol", 1000)];
    manager
        .bulk_upsert(&rows, AssetClass::EquityUs, DataCategory::HistoricalBar, None)
        .unwrap();

    let conn = manager.acquire_connection(AssetClass::EquityUs).unwrap();
    let (symbol, volume, ts): (String, f64, i64) = conn
        .query_row("SELECT symbol, volume, timestamp FROM historical_bars", [], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .unwrap();
    assert_eq!(symbol, "AAPL");
    assert_eq!(volume, 1000.0);
    assert_eq!(ts, 1_704_153_600_000);
}

#[test]
fn test_invalid_batch_is_not_partially_applied() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ShardConfig::with_root(dir.path());
    config.strict_validation = true;
    let manager = manager_with(config);

    let mut rows = bars("BTCUSDT", "binance", 3);
    rows[2].high = Some(1.0); // high < low
    let err = manager
        .bulk_upsert(&rows, AssetClass::Crypto, DataCategory::HistoricalBar, None)
        .unwrap_err();
    assert!(matches!(err, AppError::ValidationError(_)));
    assert_eq!(bar_count(&manager, AssetClass::Crypto), 0);
}

#[test]
fn test_best_quality_view_follows_source_priority() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));
    let class = AssetClass::EquityDomestic;

    let mut low = bars("000001.SZ", "akshare", 2);
    low.iter_mut().for_each(|b| b.close = Some(1.0));
    let mut high = bars("000001.SZ", "tushare", 1);
    high[0].close = Some(2.0);
    manager.bulk_upsert(&low, class, DataCategory::HistoricalBar, None).unwrap();
    manager.bulk_upsert(&high, class, DataCategory::HistoricalBar, None).unwrap();

    let conn = manager.acquire_connection(class).unwrap();
    let mut stmt = conn
        .prepare("SELECT data_source, close FROM best_quality_bars ORDER BY timestamp")
        .unwrap();
    let rows: Vec<(String, f64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(rows, vec![("tushare".to_string(), 2.0), ("akshare".to_string(), 1.0)]);

    // 目录视图左连接，未登记的 symbol 名称为空
    let name: Option<String> = conn
        .query_row("SELECT asset_name FROM bars_with_metadata LIMIT 1", [], |r| r.get(0))
        .unwrap();
    assert!(name.is_none());
}

#[test]
fn test_catalog_merge_keeps_history() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));
    let class = AssetClass::EquityDomestic;

    let mut first = CatalogRecord {
        name: Some("贵州茅台".to_string()),
        exchange: Some("SSE".to_string()),
        sector: Some("食品饮料".to_string()),
        data_sources: vec!["tushare".to_string()],
        tags: vec!["白酒".to_string()],
        ..CatalogRecord::default()
    };
    first.attributes.insert("board".to_string(), serde_json::json!("main"));
    let created = manager.upsert_catalog_entry("600519.SH", class, &first).unwrap();
    assert!(created.created);
    assert_eq!(created.metadata_version, 1);

    let mut second = CatalogRecord {
        sector: Some("  ".to_string()),
        data_sources: vec!["akshare".to_string(), "tushare".to_string()],
        tags: vec!["消费".to_string()],
        total_shares: Some(1.256e9),
        ..CatalogRecord::default()
    };
    second.attributes.insert("lot".to_string(), serde_json::json!(100));
    let merged = manager.upsert_catalog_entry("600519.SH", class, &second).unwrap();
    assert!(!merged.created);
    assert_eq!(merged.metadata_version, 2);

    let conn = manager.acquire_connection(class).unwrap();
    let (name, sector, sources, tags, attributes): (String, String, String, String, String) = conn
        .query_row(
            "SELECT name, sector, data_sources, tags, attributes FROM asset_catalog WHERE symbol = '600519.SH'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .unwrap();
    // 空白的板块信息不会覆盖已有值
    assert_eq!(name, "贵州茅台");
    assert_eq!(sector, "食品饮料");
    let sources: Vec<String> = serde_json::from_str(&sources).unwrap();
    assert_eq!(sources, vec!["tushare", "akshare"]);
    let tags: Vec<String> = serde_json::from_str(&tags).unwrap();
    assert_eq!(tags, vec!["白酒", "消费"]);
    let attributes: serde_json::Value = serde_json::from_str(&attributes).unwrap();
    assert_eq!(attributes["board"], "main");
    assert_eq!(attributes["lot"], 100);
}

#[test]
fn test_bulk_catalog_rows_keep_version_and_merge_rules() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));
    let class = AssetClass::EquityUs;

    let entry = CatalogRecord {
        sector: Some("Technology".to_string()),
        data_sources: vec!["yfinance".to_string()],
        ..CatalogRecord::default()
    };
    manager.upsert_catalog_entry("MSFT", class, &entry).unwrap();
    assert_eq!(manager.upsert_catalog_entry("MSFT", class, &entry).unwrap().metadata_version, 2);

    let row = GenericRecord::new()
        .set("symbol", "MSFT")
        .set("name", "Microsoft")
        .set("sector", "")
        .set("data_sources", serde_json::json!(["alpaca"]));
    let written = manager.bulk_upsert(&[row], class, DataCategory::AssetCatalog, None).unwrap();
    assert_eq!(written, 1);

    let conn = manager.acquire_connection(class).unwrap();
    let (name, sector, sources, version): (String, String, String, i64) = conn
        .query_row(
            "SELECT name, sector, data_sources, metadata_version FROM asset_catalog WHERE symbol = 'MSFT'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap();
    assert_eq!(version, 3);
    assert_eq!(name, "Microsoft");
    assert_eq!(sector, "Technology");
    let sources: Vec<String> = serde_json::from_str(&sources).unwrap();
    assert_eq!(sources, vec!["yfinance", "alpaca"]);
    drop(conn);
    assert!(manager.shard_handle(class).unwrap().known_data_sources.contains("alpaca"));
}

#[test]
fn test_pool_exhaustion_reports_typed_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ShardConfig::with_root(dir.path());
    config.pool_size = 5;
    config.connection_timeout_secs = 1;
    let manager = manager_with(config);

    let held: Vec<_> = (0..5)
        .map(|_| manager.acquire_connection(AssetClass::Futures).unwrap())
        .collect();
    let err = manager.acquire_connection(AssetClass::Futures).unwrap_err();
    assert!(matches!(err, AppError::PoolExhausted { .. }), "unexpected: {:?}", err);
    assert!(err.is_retryable());

    drop(held);
    assert!(manager.acquire_connection(AssetClass::Futures).is_ok());
}

#[test]
fn test_health_and_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));

    manager.bulk_upsert(&bars("ETHUSDT", "binance", 4), AssetClass::Crypto, DataCategory::HistoricalBar, None).unwrap();

    let healthy = manager.health_check(AssetClass::Crypto);
    assert_eq!(healthy.status, market_data_hub::common::HealthStatus::Healthy);
    assert!(healthy.error.is_none());

    let missing = manager.health_check(AssetClass::Bond);
    assert_eq!(missing.status, market_data_hub::common::HealthStatus::Unhealthy);
    assert!(!missing.exists);

    let stats = manager.get_statistics().unwrap();
    assert_eq!(stats.shard_count, 1);
    assert_eq!(stats.total_records, 4);
    assert_eq!(stats.per_class[&AssetClass::Crypto].per_table["historical_bars"], 4);
}

#[test]
fn test_backup_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));
    let class = AssetClass::Crypto;

    manager.bulk_upsert(&bars("BTCUSDT", "binance", 3), class, DataCategory::HistoricalBar, None).unwrap();
    let backup = manager.backup(class).unwrap();
    assert!(backup.exists());
    assert!(backup.starts_with(dir.path()));

    manager.bulk_upsert(&bars("SOLUSDT", "binance", 2), class, DataCategory::HistoricalBar, None).unwrap();
    assert_eq!(bar_count(&manager, class), 5);

    let refused = manager.restore(class, &backup, false).unwrap_err();
    assert!(matches!(refused, AppError::ShardExists(_)));

    let report = manager.restore(class, &backup, true).unwrap();
    assert!(report.previous_backup.is_some());
    assert_eq!(report.table_count, BASE_TABLES.len() as i64 + 1);
    assert_eq!(bar_count(&manager, class), 3);
}

#[test]
fn test_backup_includes_writes_made_during_open_read() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));
    let class = AssetClass::Crypto;
    manager.bulk_upsert(&bars("BTCUSDT", "binance", 3), class, DataCategory::HistoricalBar, None).unwrap();

    // 打开的读事务会阻止 WAL 检查点，新写入停留在 WAL 中
    let reader = manager.acquire_connection(class).unwrap();
    reader.execute_batch("BEGIN").unwrap();
    let seen: i64 = reader.query_row("SELECT COUNT(*) FROM historical_bars", [], |r| r.get(0)).unwrap();
    assert_eq!(seen, 3);
    manager.bulk_upsert(&bars("ETHUSDT", "binance", 2), class, DataCategory::HistoricalBar, None).unwrap();

    let backup = manager.backup(class).unwrap();
    reader.execute_batch("COMMIT").unwrap();
    drop(reader);

    let copy = Connection::open_with_flags(&backup, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
    let verdict: String = copy.query_row("PRAGMA integrity_check", [], |r| r.get(0)).unwrap();
    assert_eq!(verdict, "ok");
    let rows: i64 = copy.query_row("SELECT COUNT(*) FROM historical_bars", [], |r| r.get(0)).unwrap();
    assert_eq!(rows, 5);
    // 备份过程中分片保持可用
    assert_eq!(bar_count(&manager, class), 5);
}

#[test]
fn test_restore_waits_for_borrowed_connections() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ShardConfig::with_root(dir.path());
    config.connection_timeout_secs = 1;
    let manager = manager_with(config);
    let class = AssetClass::Crypto;

    manager.bulk_upsert(&bars("BTCUSDT", "binance", 2), class, DataCategory::HistoricalBar, None).unwrap();
    let backup = manager.backup(class).unwrap();
    manager.bulk_upsert(&bars("SOLUSDT", "binance", 1), class, DataCategory::HistoricalBar, None).unwrap();

    let held = manager.acquire_connection(class).unwrap();
    let err = manager.restore(class, &backup, true).unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)), "unexpected: {:?}", err);
    // 超时后分片原样保留
    assert!(manager.is_open(class));
    drop(held);
    assert_eq!(bar_count(&manager, class), 3);

    manager.restore(class, &backup, true).unwrap();
    assert_eq!(bar_count(&manager, class), 2);
}

#[test]
fn test_delete_shard_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with(ShardConfig::with_root(dir.path()));

    let path = manager.get_or_create_shard(AssetClass::Fund).unwrap();
    assert!(manager.delete_shard(AssetClass::Fund).unwrap());
    assert!(!path.exists());
    assert!(!manager.is_open(AssetClass::Fund));
    assert!(!manager.delete_shard(AssetClass::Fund).unwrap());
}
