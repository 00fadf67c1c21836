//! 基于临时暂存表的批量 upsert
//!
//! 行先写入 TEMP 暂存表，再用一条 `INSERT ... SELECT ... ON CONFLICT DO UPDATE`
//! 合并进目标表。整个过程在同一个事务里，暂存表在任何路径上都会被删除。

use crate::common::{now_millis, AppError, Result};
use crate::shard::records::{canonical_column, parse_timestamp_text, validate_rows, TableRow};
use crate::shard::schema::{live_columns, TableSchema};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, instrument, warn};

/// 引擎自己维护的列，调用方提供的值会被覆盖
const ENGINE_COLUMNS: &[&str] = &["created_at", "updated_at"];

/// 一次批量写入的结果
#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    pub rows_written: usize,
    /// 目标表中不存在、被丢弃的列
    pub dropped_columns: BTreeSet<String>,
    pub warnings: Vec<String>,
    pub data_sources: BTreeSet<String>,
}

/// 把一行转换为 规范列名 → 值，并丢弃目标表没有的列
fn normalize_row<R: TableRow>(
    row: &R,
    table: &TableSchema,
    live: &HashSet<String>,
    dropped: &mut BTreeSet<String>,
) -> BTreeMap<String, Value> {
    let mut values: BTreeMap<String, Value> = BTreeMap::new();

    for (name, value) in row.columns() {
        let canonical = canonical_column(&name);
        let is_alias = canonical != name.trim().to_ascii_lowercase();
        if !live.contains(&canonical) {
            dropped.insert(name);
            continue;
        }
        if ENGINE_COLUMNS.contains(&canonical.as_str()) {
            continue;
        }
        // 规范名优先于别名
        if is_alias && values.contains_key(&canonical) {
            continue;
        }
        let value = match (table.time_column, value) {
            (Some(time_col), Value::Text(text)) if time_col == canonical => match parse_timestamp_text(&text) {
                Some(millis) => Value::Integer(millis),
                None => Value::Text(text),
            },
            (_, v) => v,
        };
        values.insert(canonical, value);
    }
    values
}

/// 把 rows 合并进 `table`，返回写入的行数
#[instrument(target = "ShardUpsert", skip_all, fields(table = table.name, row_count = rows.len()), err)]
pub fn bulk_upsert_rows<R: TableRow>(
    conn: &Connection,
    table: &TableSchema,
    rows: &[R],
    strict_validation: bool,
) -> Result<UpsertReport> {
    let mut report = UpsertReport::default();
    if rows.is_empty() {
        return Ok(report);
    }

    let validation = validate_rows(rows, strict_validation)?;
    for w in &validation.warnings {
        warn!(target: "ShardUpsert", table = table.name, warning = %w, "数据校验警告");
    }
    report.warnings = validation.warnings;

    let live_list = live_columns(conn, table.name)?;
    if live_list.is_empty() {
        return Err(AppError::DatabaseError(format!("目标表 {} 不存在", table.name)));
    }
    let live: HashSet<String> = live_list.iter().cloned().collect();

    let now = now_millis();
    let mut normalized = Vec::with_capacity(rows.len());
    let mut present: HashSet<String> = HashSet::new();
    for (idx, row) in rows.iter().enumerate() {
        let mut values = normalize_row(row, table, &live, &mut report.dropped_columns);

        if !table.autoincrement_key {
            for key in table.primary_key {
                if matches!(values.get(*key), None | Some(Value::Null)) {
                    return Err(AppError::ValidationError(format!(
                        "第 {} 行缺少主键列 {} (表 {})",
                        idx, key, table.name
                    )));
                }
            }
        }

        for engine_col in ENGINE_COLUMNS {
            if live.contains(*engine_col) {
                values.insert(engine_col.to_string(), Value::Integer(now));
            }
        }
        if live.contains("metadata_version") && !values.contains_key("metadata_version") {
            values.insert("metadata_version".to_string(), Value::Integer(1));
        }

        if let Some(source) = row.data_source() {
            report.data_sources.insert(source.to_string());
        }
        present.extend(values.keys().cloned());
        normalized.push(values);
    }

    if !report.dropped_columns.is_empty() {
        debug!(
            target: "ShardUpsert",
            table = table.name,
            dropped = ?report.dropped_columns,
            "丢弃目标表中不存在的列"
        );
    }

    // 按表定义的列顺序排列本批出现过的列
    let columns: Vec<&str> = live_list
        .iter()
        .map(String::as_str)
        .filter(|c| present.contains(*c))
        .collect();
    let column_list = columns.join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");

    let stage = format!("stage_{}", table.name);
    let drop_stage = format!("DROP TABLE IF EXISTS temp.{}", stage);

    // 事务结束（提交或回滚）之后再删除暂存表
    let _stage_guard = scopeguard::guard((), |_| {
        if let Err(e) = conn.execute_batch(&drop_stage) {
            warn!(target: "ShardUpsert", stage = %stage, error.details = %e, "删除暂存表失败");
        }
    });

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS temp.{stage};
         CREATE TEMP TABLE {stage} AS SELECT * FROM main.{table} WHERE 0;",
        stage = stage,
        table = table.name
    ))?;

    {
        let mut insert = tx.prepare(&format!(
            "INSERT INTO temp.{} ({}) VALUES ({})",
            stage, column_list, placeholders
        ))?;
        for values in &normalized {
            let row_values = columns
                .iter()
                .map(|c| values.get(*c).cloned().unwrap_or(Value::Null));
            insert.execute(params_from_iter(row_values))?;
        }
    }

    let merge_sql = if table.autoincrement_key {
        format!(
            "INSERT INTO main.{table} ({cols}) SELECT {cols} FROM temp.{stage}",
            table = table.name,
            cols = column_list,
            stage = stage
        )
    } else {
        let mut updates: Vec<String> = columns
            .iter()
            .filter(|c| !table.is_key_column(c) && **c != "created_at" && **c != "metadata_version")
            .map(|c| format!("{c} = excluded.{c}", c = c))
            .collect();
        // 版本号只增不减
        if columns.contains(&"metadata_version") {
            updates.push(format!("metadata_version = {}.metadata_version + 1", table.name));
        }
        format!(
            "INSERT INTO main.{table} ({cols}) SELECT {cols} FROM temp.{stage} WHERE true
             ON CONFLICT({keys}) DO UPDATE SET {updates}",
            table = table.name,
            cols = column_list,
            stage = stage,
            keys = table.primary_key.join(", "),
            updates = updates.join(", ")
        )
    };
    tx.execute(&merge_sql, [])?;
    tx.commit()?;

    report.rows_written = normalized.len();
    debug!(
        target: "ShardUpsert",
        decision = "upsert_committed",
        table = table.name,
        rows = report.rows_written,
        "批量写入完成"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AssetClass;
    use crate::shard::records::{BarRecord, GenericRecord};
    use crate::shard::schema::{initialize_schema, HISTORICAL_BARS, TICK_DATA};

    fn shard() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, AssetClass::EquityUs, "none", &["yfinance".to_string()]).unwrap();
        conn
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_upsert_updates_on_conflict() {
        let conn = shard();
        let bar = BarRecord::new("AAPL", "yfinance", 1_000, "1d").with_ohlcv(1.0, 2.0, 0.5, 1.5, 10.0);
        bulk_upsert_rows(&conn, &HISTORICAL_BARS, &[bar.clone()], false).unwrap();

        let mut newer = bar.clone();
        newer.close = Some(1.8);
        bulk_upsert_rows(&conn, &HISTORICAL_BARS, &[newer], false).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM historical_bars"), 1);
        let close: f64 = conn
            .query_row("SELECT close FROM historical_bars WHERE symbol = 'AAPL'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(close, 1.8);
        // 暂存表已清理
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table'"), 0);
    }

    #[test]
    fn test_generic_aliases_and_unknown_columns() {
        let conn = shard();
        let row = GenericRecord::new()
            .set("ts_code", "MSFT")
            .set("source", "yfinance")
            .set("trade_date", "2024-01-02")
            .set("frequency", "1d")
            .set("vol", 5.0)
            .set("not_a_column", 1);
        let report = bulk_upsert_rows(&conn, &HISTORICAL_BARS, &[row], false).unwrap();
        assert_eq!(report.rows_written, 1);
        assert!(report.dropped_columns.contains("not_a_column"));

        let (ts, vol): (i64, f64) = conn
            .query_row("SELECT timestamp, volume FROM historical_bars", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(ts, 1_704_153_600_000);
        assert_eq!(vol, 5.0);
    }

    #[test]
    fn test_missing_key_rejects_whole_batch() {
        let conn = shard();
        let rows = vec![
            GenericRecord::new().set("symbol", "A").set("data_source", "x").set("timestamp", 1).set("seq", 1),
            GenericRecord::new().set("symbol", "B").set("data_source", "x").set("timestamp", 1),
        ];
        assert!(matches!(
            bulk_upsert_rows(&conn, &TICK_DATA, &rows, false),
            Err(AppError::ValidationError(_))
        ));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM tick_data"), 0);
    }

    #[test]
    fn test_strict_validation_rejects_bad_bar() {
        let conn = shard();
        let bad = BarRecord::new("AAPL", "yfinance", 1, "1d").with_ohlcv(1.0, 0.5, 2.0, 1.0, -1.0);
        assert!(bulk_upsert_rows(&conn, &HISTORICAL_BARS, &[bad.clone()], true).is_err());
        assert_eq!(bulk_upsert_rows(&conn, &HISTORICAL_BARS, &[bad], false).unwrap().rows_written, 1);
    }
}
