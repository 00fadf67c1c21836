//! 分片的规范表结构与派生视图
//!
//! 表名、列名与冲突键是外部工具直接读取的磁盘契约，修改前需要同步所有读取方。

use crate::common::{now_millis, AppError, AssetClass, DataCategory, Result};
use rusqlite::{params, Connection};
use tracing::{debug, instrument};

/// 分片表结构版本，记录在 shard_metadata 中
pub const SCHEMA_VERSION: &str = "3";

pub const METADATA_TABLE: &str = "shard_metadata";
pub const BEST_QUALITY_VIEW: &str = "best_quality_bars";
pub const BARS_WITH_METADATA_VIEW: &str = "bars_with_metadata";

/// 列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub not_null: bool,
}

const fn col(name: &'static str, column_type: ColumnType, not_null: bool) -> ColumnDef {
    ColumnDef { name, column_type, not_null }
}

/// 规范表定义
#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    /// 自然键，同时是 upsert 的冲突键
    pub primary_key: &'static [&'static str],
    /// 整数自增主键的表（质量日志）不参与冲突更新
    pub autoincrement_key: bool,
    /// 时间范围过滤使用的列
    pub time_column: Option<&'static str>,
    /// 需要建立的二级索引，每项为列名列表
    pub indexes: &'static [&'static [&'static str]],
}

use ColumnType::{Integer, Real, Text};

pub const HISTORICAL_BARS: TableSchema = TableSchema {
    name: "historical_bars",
    columns: &[
        col("symbol", Text, true),
        col("data_source", Text, true),
        col("timestamp", Integer, true),
        col("frequency", Text, true),
        col("open", Real, false),
        col("high", Real, false),
        col("low", Real, false),
        col("close", Real, false),
        col("volume", Real, false),
        col("amount", Real, false),
        col("adj_close", Real, false),
        col("adj_factor", Real, false),
        col("turnover_rate", Real, false),
        col("vwap", Real, false),
        col("created_at", Integer, true),
        col("updated_at", Integer, true),
    ],
    primary_key: &["symbol", "data_source", "timestamp", "frequency"],
    autoincrement_key: false,
    time_column: Some("timestamp"),
    indexes: &[&["symbol", "timestamp"], &["timestamp"]],
};

pub const REALTIME_QUOTES: TableSchema = TableSchema {
    name: "realtime_quotes",
    columns: &[
        col("symbol", Text, true),
        col("data_source", Text, true),
        col("timestamp", Integer, true),
        col("price", Real, false),
        col("open", Real, false),
        col("high", Real, false),
        col("low", Real, false),
        col("pre_close", Real, false),
        col("volume", Real, false),
        col("amount", Real, false),
        col("bid_price", Real, false),
        col("ask_price", Real, false),
        col("bid_volume", Real, false),
        col("ask_volume", Real, false),
        col("change_pct", Real, false),
        col("created_at", Integer, true),
        col("updated_at", Integer, true),
    ],
    primary_key: &["symbol", "data_source", "timestamp"],
    autoincrement_key: false,
    time_column: Some("timestamp"),
    indexes: &[&["symbol", "timestamp"]],
};

pub const TICK_DATA: TableSchema = TableSchema {
    name: "tick_data",
    columns: &[
        col("symbol", Text, true),
        col("data_source", Text, true),
        col("timestamp", Integer, true),
        col("seq", Integer, true),
        col("price", Real, false),
        col("volume", Real, false),
        col("amount", Real, false),
        col("side", Text, false),
        col("created_at", Integer, true),
        col("updated_at", Integer, true),
    ],
    primary_key: &["symbol", "data_source", "timestamp", "seq"],
    autoincrement_key: false,
    time_column: Some("timestamp"),
    indexes: &[&["symbol", "timestamp"]],
};

pub const FUNDAMENTALS: TableSchema = TableSchema {
    name: "fundamentals",
    columns: &[
        col("symbol", Text, true),
        col("data_source", Text, true),
        col("report_date", Integer, true),
        col("metric", Text, true),
        col("value", Real, false),
        col("unit", Text, false),
        col("created_at", Integer, true),
        col("updated_at", Integer, true),
    ],
    primary_key: &["symbol", "data_source", "report_date", "metric"],
    autoincrement_key: false,
    time_column: Some("report_date"),
    indexes: &[&["symbol", "report_date"]],
};

pub const SECTOR_FLOWS: TableSchema = TableSchema {
    name: "sector_flows",
    columns: &[
        col("symbol", Text, true),
        col("data_source", Text, true),
        col("timestamp", Integer, true),
        col("frequency", Text, true),
        col("net_inflow", Real, false),
        col("main_inflow", Real, false),
        col("retail_inflow", Real, false),
        col("turnover", Real, false),
        col("change_pct", Real, false),
        col("created_at", Integer, true),
        col("updated_at", Integer, true),
    ],
    primary_key: &["symbol", "data_source", "timestamp", "frequency"],
    autoincrement_key: false,
    time_column: Some("timestamp"),
    indexes: &[&["symbol", "timestamp"]],
};

pub const ASSET_CATALOG: TableSchema = TableSchema {
    name: "asset_catalog",
    columns: &[
        col("symbol", Text, true),
        col("name", Text, false),
        col("asset_class", Text, false),
        col("market", Text, false),
        col("exchange", Text, false),
        col("sector", Text, false),
        col("industry", Text, false),
        col("listing_date", Text, false),
        col("total_shares", Real, false),
        col("float_shares", Real, false),
        col("data_sources", Text, false),
        col("quality_score", Real, false),
        col("tags", Text, false),
        col("attributes", Text, false),
        col("metadata_version", Integer, true),
        col("created_at", Integer, true),
        col("updated_at", Integer, true),
    ],
    primary_key: &["symbol"],
    autoincrement_key: false,
    time_column: None,
    indexes: &[&["asset_class"], &["sector"]],
};

pub const DATA_QUALITY_LOG: TableSchema = TableSchema {
    name: "data_quality_log",
    columns: &[
        col("id", Integer, false),
        col("symbol", Text, true),
        col("data_source", Text, true),
        col("check_date", Integer, true),
        col("quality_score", Real, false),
        col("anomaly_count", Integer, false),
        col("missing_count", Integer, false),
        col("details", Text, false),
    ],
    primary_key: &["id"],
    autoincrement_key: true,
    time_column: Some("check_date"),
    indexes: &[&["symbol", "check_date"]],
};

/// 所有基础表，按创建顺序排列
pub const BASE_TABLES: &[TableSchema] = &[
    HISTORICAL_BARS,
    REALTIME_QUOTES,
    TICK_DATA,
    FUNDAMENTALS,
    SECTOR_FLOWS,
    ASSET_CATALOG,
    DATA_QUALITY_LOG,
];

impl TableSchema {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.contains(&name)
    }

    fn create_table_sql(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.columns.len() + 1);
        for column in self.columns {
            if self.autoincrement_key && self.primary_key == [column.name] {
                parts.push(format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", column.name));
                continue;
            }
            let mut def = format!("{} {}", column.name, column.column_type.sql());
            if column.not_null {
                def.push_str(" NOT NULL");
            }
            parts.push(def);
        }
        if !self.autoincrement_key {
            parts.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        }
        format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", self.name, parts.join(",\n    "))
    }

    fn create_index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|cols| {
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({})",
                    self.name,
                    cols.join("_"),
                    self.name,
                    cols.join(", ")
                )
            })
            .collect()
    }
}

/// 按名称查找规范表
pub fn table_schema(name: &str) -> Option<&'static TableSchema> {
    BASE_TABLES.iter().find(|t| t.name == name)
}

/// 数据类别对应的规范表
pub fn schema_for_category(category: DataCategory) -> &'static TableSchema {
    match category {
        DataCategory::HistoricalBar => &BASE_TABLES[0],
        DataCategory::RealtimeQuote => &BASE_TABLES[1],
        DataCategory::Tick => &BASE_TABLES[2],
        DataCategory::Fundamental => &BASE_TABLES[3],
        DataCategory::SectorFlow => &BASE_TABLES[4],
        DataCategory::AssetCatalog => &BASE_TABLES[5],
        DataCategory::QualityLog => &BASE_TABLES[6],
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// 数据源优先级表达式，未列出的数据源排在最后
fn source_rank_expr(source_priority: &[String]) -> String {
    if source_priority.is_empty() {
        return "999".to_string();
    }
    let arms: Vec<String> = source_priority
        .iter()
        .enumerate()
        .map(|(rank, source)| format!("WHEN {} THEN {}", quote_literal(source), rank + 1))
        .collect();
    format!("CASE b.data_source {} ELSE 999 END", arms.join(" "))
}

/// 派生视图定义：(视图名, SELECT 语句)
pub fn view_definitions(source_priority: &[String]) -> Vec<(&'static str, String)> {
    let bar_columns = HISTORICAL_BARS
        .columns
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");

    let best_quality = format!(
        "SELECT {cols} FROM (
            SELECT b.*, ROW_NUMBER() OVER (
                PARTITION BY b.symbol, b.timestamp, b.frequency
                ORDER BY {rank} ASC, b.updated_at DESC
            ) AS source_rank
            FROM historical_bars b
        ) WHERE source_rank = 1",
        cols = bar_columns,
        rank = source_rank_expr(source_priority),
    );

    let with_metadata = "SELECT b.*, c.name AS asset_name, c.asset_class, c.market, c.exchange,
            c.sector, c.industry, c.listing_date, c.quality_score AS catalog_quality_score
        FROM historical_bars b
        LEFT JOIN asset_catalog c ON b.symbol = c.symbol"
        .to_string();

    vec![
        (BEST_QUALITY_VIEW, best_quality),
        (BARS_WITH_METADATA_VIEW, with_metadata),
    ]
}

/// 初始化分片表结构：先建表再建视图，最后写入元数据，整体在一个事务内完成
///
/// 任何一步失败都会回滚并返回错误，不允许产生半初始化的分片
#[instrument(target = "ShardSchema", skip(conn, source_priority), fields(asset_class = %asset_class), err)]
pub fn initialize_schema(
    conn: &Connection,
    asset_class: AssetClass,
    compression: &str,
    source_priority: &[String],
) -> Result<()> {
    let shard = asset_class.as_str().to_string();
    let init_err = |stage: &str, e: rusqlite::Error| AppError::ShardInitError {
        shard: shard.clone(),
        reason: format!("{}: {}", stage, e),
    };

    let tx = conn.unchecked_transaction().map_err(|e| init_err("begin", e))?;

    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        METADATA_TABLE
    ))
    .map_err(|e| init_err("create shard_metadata", e))?;

    for table in BASE_TABLES {
        tx.execute_batch(&table.create_table_sql())
            .map_err(|e| init_err(&format!("create table {}", table.name), e))?;
        for index_sql in table.create_index_sql() {
            tx.execute_batch(&index_sql)
                .map_err(|e| init_err(&format!("create index on {}", table.name), e))?;
        }
        debug!(target: "ShardSchema", decision = "table_ensured", table = table.name, "规范表创建或确认存在");
    }

    // 视图依赖基础表，必须在建表之后；先删后建，与建表处于同一事务中
    for (view, select) in view_definitions(source_priority) {
        tx.execute_batch(&format!("DROP VIEW IF EXISTS {}", view))
            .map_err(|e| init_err(&format!("drop view {}", view), e))?;
        tx.execute_batch(&format!("CREATE VIEW {} AS {}", view, select))
            .map_err(|e| init_err(&format!("create view {}", view), e))?;
        debug!(target: "ShardSchema", decision = "view_created", view, "派生视图已重建");
    }

    let now = now_millis();
    let created_at = now.to_string();
    tx.execute(
        &format!("INSERT OR IGNORE INTO {} (key, value, updated_at) VALUES ('created_at', ?1, ?2)", METADATA_TABLE),
        params![created_at, now],
    )
    .map_err(|e| init_err("write metadata", e))?;

    for (key, value) in [
        ("asset_class", asset_class.as_str()),
        ("schema_version", SCHEMA_VERSION),
        ("compression", compression),
    ] {
        tx.execute(
            &format!(
                "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                METADATA_TABLE
            ),
            params![key, value, now],
        )
        .map_err(|e| init_err("write metadata", e))?;
    }

    tx.commit().map_err(|e| init_err("commit", e))?;
    Ok(())
}

/// 读取分片元数据
pub fn read_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;
    let value = conn
        .query_row(
            &format!("SELECT value FROM {} WHERE key = ?1", METADATA_TABLE),
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

/// 读取表在磁盘上的实际列（PRAGMA table_info），表不存在时返回空列表
pub fn live_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = Vec::new();
    for column in rows {
        columns.push(column?);
    }
    Ok(columns)
}

/// 统计用户表和视图的数量
pub fn count_objects(conn: &Connection, object_type: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%'",
        params![object_type],
        |row| row.get(0),
    )?;
    Ok(count)
}
