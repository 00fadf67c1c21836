//! 联邦查询模型与校验

use crate::common::{AppError, AssetClass, DataCategory, Result};
use crate::shard::schema::{schema_for_category, TableSchema, HISTORICAL_BARS};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// 合法的 SQL 标识符（聚合别名）
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Select,
    Aggregated,
    TimeSeries,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "select",
            QueryType::Aggregated => "aggregated",
            QueryType::TimeSeries => "time_series",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "select" => Ok(QueryType::Select),
            "aggregated" | "aggregate" => Ok(QueryType::Aggregated),
            "time_series" | "timeseries" => Ok(QueryType::TimeSeries),
            other => Err(format!("unknown query type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    IsNull,
    IsNotNull,
    /// value 为两个元素的数组 [low, high]
    Between,
}

/// 与前一个条件的连接方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connector {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: JsonValue,
    #[serde(default)]
    pub connector: Connector,
}

impl Filter {
    pub fn new<V: Into<JsonValue>>(field: &str, op: FilterOp, value: V) -> Self {
        Self {
            field: field.to_string(),
            op,
            value: value.into(),
            connector: Connector::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.connector = Connector::Or;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self { field: field.to_string(), descending: false }
    }

    pub fn desc(field: &str) -> Self {
        Self { field: field.to_string(), descending: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn sql(&self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub func: AggFunc,
    /// 列名；COUNT 可以使用 "*"
    pub field: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Aggregation {
    pub fn new(func: AggFunc, field: &str) -> Self {
        Self { func, field: field.to_string(), alias: None }
    }

    pub fn alias(&self) -> String {
        match &self.alias {
            Some(a) => a.clone(),
            None if self.field == "*" => format!("{}_all", self.func.sql().to_ascii_lowercase()),
            None => format!("{}_{}", self.func.sql().to_ascii_lowercase(), self.field),
        }
    }
}

/// 一次跨分片的逻辑查询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedQuery {
    pub query_type: QueryType,
    pub category: Option<DataCategory>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub asset_classes: Vec<AssetClass>,
    /// 毫秒时间戳，闭区间
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// 读取 best_quality_bars 视图而不是原始表
    #[serde(default)]
    pub best_quality: bool,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

fn default_true() -> bool {
    true
}

impl FederatedQuery {
    pub fn new(query_type: QueryType, category: DataCategory) -> Self {
        Self {
            query_type,
            category: Some(category),
            symbols: Vec::new(),
            asset_classes: Vec::new(),
            start: None,
            end: None,
            fields: Vec::new(),
            filters: Vec::new(),
            sort: Vec::new(),
            aggregations: Vec::new(),
            group_by: Vec::new(),
            limit: None,
            offset: None,
            parallel: true,
            best_quality: false,
            use_cache: true,
        }
    }

    pub fn select(category: DataCategory) -> Self {
        Self::new(QueryType::Select, category)
    }

    pub fn with_symbols(mut self, symbols: &[&str]) -> Self {
        self.symbols = symbols.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_classes(mut self, classes: &[AssetClass]) -> Self {
        self.asset_classes = classes.to_vec();
        self
    }

    pub fn with_range(mut self, start: i64, end: i64) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn group_by(mut self, fields: &[&str]) -> Self {
        self.group_by = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn paginate(mut self, limit: i64, offset: i64) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn best_quality(mut self) -> Self {
        self.best_quality = true;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// 查询的目标表结构
    pub fn table(&self) -> Result<&'static TableSchema> {
        let category = self
            .category
            .ok_or_else(|| AppError::ValidationError("查询缺少数据类别".to_string()))?;
        if self.best_quality {
            if category != DataCategory::HistoricalBar {
                return Err(AppError::ValidationError(format!(
                    "best_quality 只适用于 historical_bar，当前类别 {}",
                    category
                )));
            }
            return Ok(&HISTORICAL_BARS);
        }
        Ok(schema_for_category(category))
    }

    /// 实际读取的表或视图名
    pub fn source_name(&self) -> Result<&'static str> {
        if self.best_quality {
            self.table()?;
            return Ok(crate::shard::schema::BEST_QUALITY_VIEW);
        }
        Ok(self.table()?.name)
    }

    /// 所有 I/O 之前的校验
    pub fn validate(&self) -> Result<()> {
        let table = self.table()?;
        let invalid = |msg: String| Err(AppError::ValidationError(msg));

        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return invalid(format!("时间范围无效: start({}) > end({})", start, end));
            }
        }
        if (self.start.is_some() || self.end.is_some()) && table.time_column.is_none() {
            return invalid(format!("表 {} 没有时间列，不能按时间范围过滤", table.name));
        }
        if let Some(limit) = self.limit {
            if limit <= 0 {
                return invalid(format!("limit 必须为正数: {}", limit));
            }
        }
        if let Some(offset) = self.offset {
            if offset < 0 {
                return invalid(format!("offset 不能为负数: {}", offset));
            }
        }
        if !self.aggregations.is_empty() && self.group_by.is_empty() && self.query_type != QueryType::Aggregated {
            return invalid("聚合查询必须指定 group_by，或使用 aggregated 查询类型".to_string());
        }
        if self.query_type == QueryType::Aggregated && self.aggregations.is_empty() && self.group_by.is_empty() {
            return invalid("aggregated 查询至少需要一个聚合或分组字段".to_string());
        }

        let check_column = |field: &str, usage: &str| -> Result<()> {
            if table.has_column(field) {
                Ok(())
            } else {
                Err(AppError::ValidationError(format!(
                    "未知字段 {} ({}, 表 {})",
                    field, usage, table.name
                )))
            }
        };

        for field in &self.fields {
            check_column(field, "fields")?;
        }
        for filter in &self.filters {
            check_column(&filter.field, "filters")?;
            validate_filter_value(filter)?;
        }
        for field in &self.group_by {
            check_column(field, "group_by")?;
        }

        let mut aliases = Vec::new();
        for agg in &self.aggregations {
            if agg.field == "*" {
                if agg.func != AggFunc::Count {
                    return invalid(format!("只有 COUNT 可以使用 *，当前为 {}", agg.func.sql()));
                }
            } else {
                check_column(&agg.field, "aggregations")?;
            }
            let alias = agg.alias();
            if !is_identifier(&alias) {
                return invalid(format!("聚合别名不合法: {}", alias));
            }
            aliases.push(alias);
        }

        let aggregate = self.is_aggregate();
        for key in &self.sort {
            let is_alias = aliases.iter().any(|a| a == &key.field);
            if is_alias {
                continue;
            }
            check_column(&key.field, "sort")?;
            // 聚合结果里只有分组列和聚合别名
            if aggregate && !self.group_by.contains(&key.field) {
                return invalid(format!("聚合查询只能按分组列或聚合别名排序: {}", key.field));
            }
        }
        Ok(())
    }

    /// 排序需要但不在投影里的列；分片语句会额外选出它们，合并排序后再去掉
    pub fn sort_only_fields(&self) -> Vec<String> {
        if self.is_aggregate() || self.fields.is_empty() {
            return Vec::new();
        }
        let mut extra: Vec<String> = Vec::new();
        for key in &self.sort {
            if !self.fields.contains(&key.field) && !extra.contains(&key.field) {
                extra.push(key.field.clone());
            }
        }
        extra
    }

    /// 是否是聚合查询（决定 SELECT 子句的形态）
    pub fn is_aggregate(&self) -> bool {
        !self.aggregations.is_empty() || self.query_type == QueryType::Aggregated
    }
}

fn validate_filter_value(filter: &Filter) -> Result<()> {
    let bad = |msg: &str| {
        Err(AppError::ValidationError(format!(
            "过滤条件 {} {:?} 的取值无效: {}",
            filter.field, filter.op, msg
        )))
    };
    match filter.op {
        FilterOp::In | FilterOp::NotIn => match &filter.value {
            JsonValue::Array(items) if !items.is_empty() => Ok(()),
            _ => bad("需要非空数组"),
        },
        FilterOp::Between => match &filter.value {
            JsonValue::Array(items) if items.len() == 2 => Ok(()),
            _ => bad("需要 [low, high] 两个元素"),
        },
        FilterOp::IsNull | FilterOp::IsNotNull => Ok(()),
        _ => match &filter.value {
            JsonValue::Null => bad("不能为 null，请使用 is_null"),
            JsonValue::Array(_) | JsonValue::Object(_) => bad("需要标量"),
            _ => Ok(()),
        },
    }
}
