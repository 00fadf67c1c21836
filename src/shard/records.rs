//! 写入分片的行类型
//!
//! 常用类别使用强类型结构体，其余类别字段放进 `extra` 或直接使用 `GenericRecord`。

use crate::common::{AppError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// 上游字段别名 → 规范列名
pub const COLUMN_ALIASES: &[(&str, &str)] = &[
    ("datetime", "timestamp"),
    ("date", "timestamp"),
    ("trade_date", "timestamp"),
    ("time", "timestamp"),
    ("vol", "volume"),
    ("code", "symbol"),
    ("ts_code", "symbol"),
    ("source", "data_source"),
    ("amt", "amount"),
];

/// 规范化列名，未登记的名字原样返回（统一小写）
pub fn canonical_column(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    COLUMN_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(lower)
}

/// 价格合理性检查所需的字段
#[derive(Debug, Clone, Copy, Default)]
pub struct PriceFields {
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub price: Option<f64>,
    pub volume: Option<f64>,
}

/// 可批量写入分片表的一行数据
pub trait TableRow {
    fn symbol(&self) -> &str;

    fn data_source(&self) -> Option<&str>;

    /// 行的全部列（列名可以是别名，由写入层统一映射）
    fn columns(&self) -> Vec<(String, Value)>;

    fn price_fields(&self) -> Option<PriceFields> {
        None
    }
}

fn opt_real(v: Option<f64>) -> Value {
    v.map(Value::Real).unwrap_or(Value::Null)
}

fn opt_text(v: &Option<String>) -> Value {
    v.as_ref().map(|s| Value::Text(s.clone())).unwrap_or(Value::Null)
}

/// JSON 值转为 SQLite 值，数组和对象序列化为 JSON 文本
pub fn json_to_sql(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Real).unwrap_or(Value::Null),
        },
        JsonValue::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

/// SQLite 值转回 JSON，用于查询结果输出
pub fn sql_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Integer(i) => JsonValue::from(*i),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Blob(b) => JsonValue::String(format!("<blob {} bytes>", b.len())),
    }
}

/// 把文本形式的时间转换为毫秒时间戳，支持常见的日期写法
pub fn parse_timestamp_text(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(millis) = text.parse::<i64>() {
        // 8位纯数字按 YYYYMMDD 处理
        if text.len() == 8 {
            if let Ok(d) = NaiveDate::parse_from_str(text, "%Y%m%d") {
                return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
            }
        }
        return Some(millis);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
        }
    }
    None
}

/// 历史K线
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    pub symbol: String,
    pub data_source: String,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub frequency: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub amount: Option<f64>,
    pub adj_close: Option<f64>,
    pub adj_factor: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub vwap: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, JsonValue>,
}

impl BarRecord {
    pub fn new(symbol: &str, data_source: &str, timestamp: i64, frequency: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            data_source: data_source.to_string(),
            timestamp,
            frequency: frequency.to_string(),
            ..Self::default()
        }
    }

    /// 填充 OHLCV
    pub fn with_ohlcv(mut self, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        self.open = Some(open);
        self.high = Some(high);
        self.low = Some(low);
        self.close = Some(close);
        self.volume = Some(volume);
        self
    }
}

impl TableRow for BarRecord {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn data_source(&self) -> Option<&str> {
        Some(&self.data_source)
    }

    fn columns(&self) -> Vec<(String, Value)> {
        let mut cols = vec![
            ("symbol".to_string(), Value::Text(self.symbol.clone())),
            ("data_source".to_string(), Value::Text(self.data_source.clone())),
            ("timestamp".to_string(), Value::Integer(self.timestamp)),
            ("frequency".to_string(), Value::Text(self.frequency.clone())),
            ("open".to_string(), opt_real(self.open)),
            ("high".to_string(), opt_real(self.high)),
            ("low".to_string(), opt_real(self.low)),
            ("close".to_string(), opt_real(self.close)),
            ("volume".to_string(), opt_real(self.volume)),
            ("amount".to_string(), opt_real(self.amount)),
            ("adj_close".to_string(), opt_real(self.adj_close)),
            ("adj_factor".to_string(), opt_real(self.adj_factor)),
            ("turnover_rate".to_string(), opt_real(self.turnover_rate)),
            ("vwap".to_string(), opt_real(self.vwap)),
        ];
        cols.extend(self.extra.iter().map(|(k, v)| (k.clone(), json_to_sql(v))));
        cols
    }

    fn price_fields(&self) -> Option<PriceFields> {
        Some(PriceFields {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            price: None,
            volume: self.volume,
        })
    }
}

/// 实时行情快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub symbol: String,
    pub data_source: String,
    pub timestamp: i64,
    pub price: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub pre_close: Option<f64>,
    pub volume: Option<f64>,
    pub amount: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub bid_volume: Option<f64>,
    pub ask_volume: Option<f64>,
    pub change_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, JsonValue>,
}

impl TableRow for QuoteRecord {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn data_source(&self) -> Option<&str> {
        Some(&self.data_source)
    }

    fn columns(&self) -> Vec<(String, Value)> {
        let mut cols = vec![
            ("symbol".to_string(), Value::Text(self.symbol.clone())),
            ("data_source".to_string(), Value::Text(self.data_source.clone())),
            ("timestamp".to_string(), Value::Integer(self.timestamp)),
            ("price".to_string(), opt_real(self.price)),
            ("open".to_string(), opt_real(self.open)),
            ("high".to_string(), opt_real(self.high)),
            ("low".to_string(), opt_real(self.low)),
            ("pre_close".to_string(), opt_real(self.pre_close)),
            ("volume".to_string(), opt_real(self.volume)),
            ("amount".to_string(), opt_real(self.amount)),
            ("bid_price".to_string(), opt_real(self.bid_price)),
            ("ask_price".to_string(), opt_real(self.ask_price)),
            ("bid_volume".to_string(), opt_real(self.bid_volume)),
            ("ask_volume".to_string(), opt_real(self.ask_volume)),
            ("change_pct".to_string(), opt_real(self.change_pct)),
        ];
        cols.extend(self.extra.iter().map(|(k, v)| (k.clone(), json_to_sql(v))));
        cols
    }

    fn price_fields(&self) -> Option<PriceFields> {
        Some(PriceFields {
            open: self.open,
            high: self.high,
            low: self.low,
            close: None,
            price: self.price,
            volume: self.volume,
        })
    }
}

/// 资产目录条目；字段为 None 表示本次不提供
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub name: Option<String>,
    pub market: Option<String>,
    pub exchange: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub listing_date: Option<String>,
    pub total_shares: Option<f64>,
    pub float_shares: Option<f64>,
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub data_sources: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, JsonValue>,
}

impl CatalogRecord {
    /// 文本列的取值，未知列返回 None
    pub(crate) fn text(&self, column: &str) -> Option<String> {
        let field = match column {
            "name" => &self.name,
            "market" => &self.market,
            "exchange" => &self.exchange,
            "sector" => &self.sector,
            "industry" => &self.industry,
            "listing_date" => &self.listing_date,
            _ => return None,
        };
        field.clone()
    }

    pub(crate) fn text_value(&self, column: &str) -> Value {
        opt_text(&self.text(column))
    }

    /// 从通用列集合构造目录条目；数组列接受 JSON 数组文本或逗号分隔文本
    pub fn from_columns(columns: Vec<(String, Value)>) -> Self {
        let mut record = Self::default();
        for (name, value) in columns {
            let column = canonical_column(&name);
            let text = match &value {
                Value::Text(s) => Some(s.clone()),
                Value::Integer(i) => Some(i.to_string()),
                Value::Real(f) => Some(f.to_string()),
                _ => None,
            };
            let real = match &value {
                Value::Integer(i) => Some(*i as f64),
                Value::Real(f) => Some(*f),
                Value::Text(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match column.as_str() {
                "name" => record.name = text,
                "market" => record.market = text,
                "exchange" => record.exchange = text,
                "sector" => record.sector = text,
                "industry" => record.industry = text,
                "listing_date" => record.listing_date = text,
                "total_shares" => record.total_shares = real,
                "float_shares" => record.float_shares = real,
                "quality_score" => record.quality_score = real,
                "data_sources" => record.data_sources = parse_text_list(text.as_deref()),
                "tags" => record.tags = parse_text_list(text.as_deref()),
                "attributes" => {
                    if let Some(JsonValue::Object(map)) =
                        text.as_deref().and_then(|t| serde_json::from_str::<JsonValue>(t).ok())
                    {
                        record.attributes = map;
                    }
                }
                _ => {}
            }
        }
        record
    }
}

fn parse_text_list(text: Option<&str>) -> Vec<String> {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(text) {
        Ok(items) => items,
        Err(_) => text.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
    }
}

/// 任意列的通用行，列名允许使用上游别名
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenericRecord {
    pub values: BTreeMap<String, JsonValue>,
}

impl GenericRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<V: Into<JsonValue>>(mut self, column: &str, value: V) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    /// 按规范列名查找，同时识别别名
    fn lookup(&self, canonical: &str) -> Option<&JsonValue> {
        self.values
            .iter()
            .find(|(k, _)| canonical_column(k) == canonical)
            .map(|(_, v)| v)
    }

    fn lookup_f64(&self, canonical: &str) -> Option<f64> {
        self.lookup(canonical).and_then(JsonValue::as_f64)
    }
}

impl TableRow for GenericRecord {
    fn symbol(&self) -> &str {
        self.lookup("symbol").and_then(JsonValue::as_str).unwrap_or("")
    }

    fn data_source(&self) -> Option<&str> {
        self.lookup("data_source").and_then(JsonValue::as_str)
    }

    fn columns(&self) -> Vec<(String, Value)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), json_to_sql(v)))
            .collect()
    }

    fn price_fields(&self) -> Option<PriceFields> {
        let fields = PriceFields {
            open: self.lookup_f64("open"),
            high: self.lookup_f64("high"),
            low: self.lookup_f64("low"),
            close: self.lookup_f64("close"),
            price: self.lookup_f64("price"),
            volume: self.lookup_f64("volume"),
        };
        Some(fields)
    }
}

/// 单行的价格合理性问题
pub fn price_issues(fields: &PriceFields) -> Vec<String> {
    let mut issues = Vec::new();
    for (name, value) in [
        ("open", fields.open),
        ("high", fields.high),
        ("low", fields.low),
        ("close", fields.close),
        ("price", fields.price),
    ] {
        if let Some(v) = value {
            if v < 0.0 {
                issues.push(format!("{} 为负数: {}", name, v));
            }
        }
    }
    if let Some(v) = fields.volume {
        if v < 0.0 {
            issues.push(format!("volume 为负数: {}", v));
        }
    }
    if let (Some(high), Some(low)) = (fields.high, fields.low) {
        if high < low {
            issues.push(format!("high({}) < low({})", high, low));
        }
        for (name, value) in [("open", fields.open), ("close", fields.close)] {
            if let Some(v) = value {
                if v > high || v < low {
                    issues.push(format!("{}({}) 超出 [low, high] 区间", name, v));
                }
            }
        }
    }
    issues
}

/// 批量校验结果
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub checked: usize,
    pub warnings: Vec<String>,
}

/// 校验一批行：空 symbol 一律拒绝；价格问题在严格模式下拒绝，否则只记录警告
pub fn validate_rows<R: TableRow>(rows: &[R], strict: bool) -> Result<ValidationReport> {
    let mut report = ValidationReport { checked: rows.len(), warnings: Vec::new() };

    for (idx, row) in rows.iter().enumerate() {
        if row.symbol().trim().is_empty() {
            return Err(AppError::ValidationError(format!("第 {} 行缺少 symbol", idx)));
        }
        if let Some(fields) = row.price_fields() {
            for issue in price_issues(&fields) {
                let message = format!("第 {} 行 {}: {}", idx, row.symbol(), issue);
                if strict {
                    return Err(AppError::ValidationError(message));
                }
                report.warnings.push(message);
            }
        }
    }
    Ok(report)
}
