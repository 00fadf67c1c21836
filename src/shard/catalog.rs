//! 资产目录的插入或合并
//!
//! 合并规则：
//! - `data_sources`、`tags` 取并集，保留已有顺序
//! - 粘性字段（sector、industry、listing_date、total_shares、float_shares）忽略空值
//! - `attributes` 按键合并，新值覆盖旧值
//! - 每次成功更新 `metadata_version` 加一

use crate::common::{now_millis, AppError, AssetClass, Result};
use crate::shard::records::{canonical_column, validate_rows, CatalogRecord, TableRow};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

const STICKY_TEXT: &[&str] = &["sector", "industry", "listing_date"];
const PLAIN_TEXT: &[&str] = &["name", "market", "exchange"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogUpsertOutcome {
    pub symbol: String,
    pub created: bool,
    pub metadata_version: i64,
    /// 本次实际发生变化的字段
    pub changed_fields: Vec<String>,
}

/// 目录中已有的一行
#[derive(Debug, Clone, Default)]
struct ExistingEntry {
    text: Vec<(String, Option<String>)>,
    total_shares: Option<f64>,
    float_shares: Option<f64>,
    quality_score: Option<f64>,
    data_sources: Vec<String>,
    tags: Vec<String>,
    attributes: serde_json::Map<String, JsonValue>,
    asset_class: Option<String>,
    metadata_version: i64,
}

impl ExistingEntry {
    fn text(&self, column: &str) -> Option<&str> {
        self.text
            .iter()
            .find(|(c, _)| c == column)
            .and_then(|(_, v)| v.as_deref())
    }
}

fn parse_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

fn parse_object(raw: Option<String>) -> serde_json::Map<String, JsonValue> {
    match raw.and_then(|s| serde_json::from_str::<JsonValue>(&s).ok()) {
        Some(JsonValue::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

fn load_existing(conn: &Connection, symbol: &str) -> Result<Option<ExistingEntry>> {
    let entry = conn
        .query_row(
            "SELECT name, market, exchange, sector, industry, listing_date,
                    total_shares, float_shares, quality_score, data_sources, tags,
                    attributes, asset_class, metadata_version
             FROM asset_catalog WHERE symbol = ?1",
            params![symbol],
            |row| {
                let mut text = Vec::with_capacity(6);
                for (idx, col) in ["name", "market", "exchange", "sector", "industry", "listing_date"]
                    .iter()
                    .enumerate()
                {
                    text.push((col.to_string(), row.get::<_, Option<String>>(idx)?));
                }
                Ok(ExistingEntry {
                    text,
                    total_shares: row.get(6)?,
                    float_shares: row.get(7)?,
                    quality_score: row.get(8)?,
                    data_sources: parse_list(row.get(9)?),
                    tags: parse_list(row.get(10)?),
                    attributes: parse_object(row.get(11)?),
                    asset_class: row.get(12)?,
                    metadata_version: row.get(13)?,
                })
            },
        )
        .optional()?;
    Ok(entry)
}

/// 有序并集：保留 `base` 的顺序，追加新出现的元素
fn union_ordered(base: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged = base.to_vec();
    for item in incoming {
        let item = item.trim();
        if !item.is_empty() && !merged.iter().any(|m| m == item) {
            merged.push(item.to_string());
        }
    }
    merged
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true)
}

/// 插入或合并一条目录记录
#[instrument(target = "ShardCatalog", skip(conn, entry), fields(symbol = %symbol, asset_class = %asset_class), err)]
pub fn upsert_catalog_entry(
    conn: &Connection,
    symbol: &str,
    asset_class: AssetClass,
    entry: &CatalogRecord,
) -> Result<CatalogUpsertOutcome> {
    let tx = conn.unchecked_transaction()?;
    let outcome = merge_entry(&tx, symbol, asset_class, entry, now_millis())?;
    tx.commit()?;
    Ok(outcome)
}

/// 批量写入目录表：每一行都走与 `upsert_catalog_entry` 相同的合并规则，整批一个事务
///
/// 行里可解析的 `asset_class` 列优先于 `asset_class` 参数。
#[instrument(target = "ShardCatalog", skip_all, fields(row_count = rows.len(), asset_class = %asset_class), err)]
pub fn bulk_merge_catalog<R: TableRow>(
    conn: &Connection,
    rows: &[R],
    asset_class: AssetClass,
    strict_validation: bool,
) -> Result<Vec<CatalogUpsertOutcome>> {
    validate_rows(rows, strict_validation)?;

    let tx = conn.unchecked_transaction()?;
    let now = now_millis();
    let mut outcomes = Vec::with_capacity(rows.len());
    for row in rows {
        let columns = row.columns();
        let row_class = columns
            .iter()
            .find(|(name, _)| canonical_column(name) == "asset_class")
            .and_then(|(_, value)| match value {
                Value::Text(text) => text.parse::<AssetClass>().ok(),
                _ => None,
            })
            .unwrap_or(asset_class);
        let entry = CatalogRecord::from_columns(columns);
        outcomes.push(merge_entry(&tx, row.symbol(), row_class, &entry, now)?);
    }
    tx.commit()?;
    Ok(outcomes)
}

fn merge_entry(
    conn: &Connection,
    symbol: &str,
    asset_class: AssetClass,
    entry: &CatalogRecord,
    now: i64,
) -> Result<CatalogUpsertOutcome> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(AppError::ValidationError("目录条目缺少 symbol".to_string()));
    }

    let outcome = match load_existing(conn, symbol)? {
        None => {
            let sources = union_ordered(&[], &entry.data_sources);
            let tags = union_ordered(&[], &entry.tags);
            conn.execute(
                "INSERT INTO asset_catalog (
                    symbol, name, asset_class, market, exchange, sector, industry, listing_date,
                    total_shares, float_shares, data_sources, quality_score, tags, attributes,
                    metadata_version, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1, ?15, ?15)",
                params![
                    symbol,
                    entry.text_value("name"),
                    asset_class.as_str(),
                    entry.text_value("market"),
                    entry.text_value("exchange"),
                    entry.text_value("sector"),
                    entry.text_value("industry"),
                    entry.text_value("listing_date"),
                    entry.total_shares,
                    entry.float_shares,
                    serde_json::to_string(&sources)?,
                    entry.quality_score,
                    serde_json::to_string(&tags)?,
                    JsonValue::Object(entry.attributes.clone()).to_string(),
                    now,
                ],
            )?;
            CatalogUpsertOutcome {
                symbol: symbol.to_string(),
                created: true,
                metadata_version: 1,
                changed_fields: Vec::new(),
            }
        }
        Some(existing) => {
            let mut changed = Vec::new();
            let mut text_values: Vec<(&str, Value)> = Vec::new();

            for column in PLAIN_TEXT {
                let incoming = entry.text(column);
                let merged = match incoming {
                    Some(v) => Some(v),
                    None => existing.text(column).map(str::to_string),
                };
                if merged.as_deref() != existing.text(column) {
                    changed.push(column.to_string());
                }
                text_values.push((*column, merged.map(Value::Text).unwrap_or(Value::Null)));
            }
            for column in STICKY_TEXT {
                let incoming = entry.text(column);
                let merged = if is_blank(&incoming) {
                    existing.text(column).map(str::to_string)
                } else {
                    incoming
                };
                if merged.as_deref() != existing.text(column) {
                    changed.push(column.to_string());
                }
                text_values.push((*column, merged.map(Value::Text).unwrap_or(Value::Null)));
            }

            let mut numeric = |name: &str, incoming: Option<f64>, current: Option<f64>| {
                let merged = incoming.or(current);
                if merged != current {
                    changed.push(name.to_string());
                }
                merged
            };
            let total_shares = numeric("total_shares", entry.total_shares, existing.total_shares);
            let float_shares = numeric("float_shares", entry.float_shares, existing.float_shares);
            let quality_score = numeric("quality_score", entry.quality_score, existing.quality_score);

            let sources = union_ordered(&existing.data_sources, &entry.data_sources);
            if sources != existing.data_sources {
                changed.push("data_sources".to_string());
            }
            let tags = union_ordered(&existing.tags, &entry.tags);
            if tags != existing.tags {
                changed.push("tags".to_string());
            }

            let mut attributes = existing.attributes.clone();
            for (key, value) in &entry.attributes {
                attributes.insert(key.clone(), value.clone());
            }
            if attributes != existing.attributes {
                changed.push("attributes".to_string());
            }

            let class_name = asset_class.as_str();
            if existing.asset_class.as_deref() != Some(class_name) {
                changed.push("asset_class".to_string());
            }

            let version = existing.metadata_version + 1;
            let lookup = |col: &str| {
                text_values
                    .iter()
                    .find(|(c, _)| *c == col)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null)
            };
            conn.execute(
                "UPDATE asset_catalog SET
                    name = ?2, asset_class = ?3, market = ?4, exchange = ?5, sector = ?6,
                    industry = ?7, listing_date = ?8, total_shares = ?9, float_shares = ?10,
                    data_sources = ?11, quality_score = ?12, tags = ?13, attributes = ?14,
                    metadata_version = ?15, updated_at = ?16
                 WHERE symbol = ?1",
                params![
                    symbol,
                    lookup("name"),
                    class_name,
                    lookup("market"),
                    lookup("exchange"),
                    lookup("sector"),
                    lookup("industry"),
                    lookup("listing_date"),
                    total_shares,
                    float_shares,
                    serde_json::to_string(&sources)?,
                    quality_score,
                    serde_json::to_string(&tags)?,
                    JsonValue::Object(attributes).to_string(),
                    version,
                    now,
                ],
            )?;

            CatalogUpsertOutcome {
                symbol: symbol.to_string(),
                created: false,
                metadata_version: version,
                changed_fields: changed,
            }
        }
    };

    debug!(
        target: "ShardCatalog",
        decision = if outcome.created { "catalog_inserted" } else { "catalog_merged" },
        symbol = %symbol,
        metadata_version = outcome.metadata_version,
        "目录条目已写入"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::schema::initialize_schema;

    fn shard() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, AssetClass::EquityDomestic, "none", &[]).unwrap();
        conn
    }

    #[test]
    fn test_insert_then_merge() {
        let conn = shard();
        let first = CatalogRecord {
            name: Some("平安银行".to_string()),
            sector: Some("金融".to_string()),
            total_shares: Some(1.9e10),
            data_sources: vec!["tushare".to_string()],
            tags: vec!["bank".to_string()],
            ..CatalogRecord::default()
        };
        let outcome = upsert_catalog_entry(&conn, "000001.SZ", AssetClass::EquityDomestic, &first).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.metadata_version, 1);

        let mut attrs = serde_json::Map::new();
        attrs.insert("board".to_string(), JsonValue::from("main"));
        let second = CatalogRecord {
            sector: Some("".to_string()),
            data_sources: vec!["akshare".to_string(), "tushare".to_string()],
            tags: vec!["bank".to_string(), "sz50".to_string()],
            attributes: attrs,
            ..CatalogRecord::default()
        };
        let outcome = upsert_catalog_entry(&conn, "000001.SZ", AssetClass::EquityDomestic, &second).unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.metadata_version, 2);
        assert!(outcome.changed_fields.contains(&"data_sources".to_string()));
        assert!(!outcome.changed_fields.contains(&"sector".to_string()));

        let (name, sector, shares, sources, tags): (String, String, f64, String, String) = conn
            .query_row(
                "SELECT name, sector, total_shares, data_sources, tags FROM asset_catalog WHERE symbol = '000001.SZ'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .unwrap();
        assert_eq!(name, "平安银行");
        assert_eq!(sector, "金融");
        assert_eq!(shares, 1.9e10);
        assert_eq!(sources, r#"["tushare","akshare"]"#);
        assert_eq!(tags, r#"["bank","sz50"]"#);
    }

    #[test]
    fn test_bulk_rows_follow_merge_rules() {
        use crate::shard::records::GenericRecord;

        let conn = shard();
        let first = CatalogRecord {
            sector: Some("银行".to_string()),
            data_sources: vec!["tushare".to_string()],
            ..CatalogRecord::default()
        };
        upsert_catalog_entry(&conn, "600036.SH", AssetClass::EquityDomestic, &first).unwrap();

        let rows = vec![
            GenericRecord::new()
                .set("symbol", "600036.SH")
                .set("sector", "")
                .set("data_sources", serde_json::json!(["akshare"])),
            GenericRecord::new().set("symbol", "000300.SH").set("asset_class", "index"),
        ];
        let outcomes = bulk_merge_catalog(&conn, &rows, AssetClass::EquityDomestic, false).unwrap();
        assert_eq!(outcomes[0].metadata_version, 2);
        assert!(!outcomes[0].created);
        assert!(outcomes[1].created);

        let (sector, sources, version): (String, String, i64) = conn
            .query_row(
                "SELECT sector, data_sources, metadata_version FROM asset_catalog WHERE symbol = '600036.SH'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(sector, "银行");
        assert_eq!(sources, r#"["tushare","akshare"]"#);
        assert_eq!(version, 2);

        let class: String = conn
            .query_row("SELECT asset_class FROM asset_catalog WHERE symbol = '000300.SH'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(class, "index");
    }

    #[test]
    fn test_version_bumps_even_without_changes() {
        let conn = shard();
        let rec = CatalogRecord::default();
        upsert_catalog_entry(&conn, "X", AssetClass::EquityDomestic, &rec).unwrap();
        let outcome = upsert_catalog_entry(&conn, "X", AssetClass::EquityDomestic, &rec).unwrap();
        assert_eq!(outcome.metadata_version, 2);
        assert!(outcome.changed_fields.is_empty());
    }
}
