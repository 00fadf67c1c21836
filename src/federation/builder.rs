//! 把查询模型渲染为参数化 SQL
//!
//! 标识符只来自已校验过的表结构，所有取值都通过参数绑定。

use crate::common::Result;
use crate::federation::query::{Connector, FederatedQuery, Filter, FilterOp};
use crate::shard::records::json_to_sql;
use crate::shard::schema::TableSchema;
use rusqlite::types::Value;
use serde_json::Value as JsonValue;

/// 一条渲染好的语句及其参数
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// WHERE 子句的表达式树
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare { column: String, op: &'static str, value: Value },
    InList { column: String, values: Vec<Value>, negated: bool },
    IsNull { column: String, negated: bool },
    Between { column: String, low: Value, high: Value },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Expr::Compare { column, op, value } => {
                sql.push_str(&format!("{} {} ?", column, op));
                params.push(value.clone());
            }
            Expr::InList { column, values, negated } => {
                let marks = vec!["?"; values.len()].join(", ");
                let keyword = if *negated { "NOT IN" } else { "IN" };
                sql.push_str(&format!("{} {} ({})", column, keyword, marks));
                params.extend(values.iter().cloned());
            }
            Expr::IsNull { column, negated } => {
                let keyword = if *negated { "IS NOT NULL" } else { "IS NULL" };
                sql.push_str(&format!("{} {}", column, keyword));
            }
            Expr::Between { column, low, high } => {
                sql.push_str(&format!("{} BETWEEN ? AND ?", column));
                params.push(low.clone());
                params.push(high.clone());
            }
            Expr::And(parts) | Expr::Or(parts) => {
                let joiner = if matches!(self, Expr::And(_)) { " AND " } else { " OR " };
                sql.push('(');
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        sql.push_str(joiner);
                    }
                    part.render(sql, params);
                }
                sql.push(')');
            }
        }
    }
}

fn filter_expr(filter: &Filter) -> Expr {
    let column = filter.field.clone();
    let scalar = || json_to_sql(&filter.value);
    let list = || match &filter.value {
        JsonValue::Array(items) => items.iter().map(json_to_sql).collect(),
        other => vec![json_to_sql(other)],
    };
    match filter.op {
        FilterOp::Eq => Expr::Compare { column, op: "=", value: scalar() },
        FilterOp::Ne => Expr::Compare { column, op: "!=", value: scalar() },
        FilterOp::Gt => Expr::Compare { column, op: ">", value: scalar() },
        FilterOp::Gte => Expr::Compare { column, op: ">=", value: scalar() },
        FilterOp::Lt => Expr::Compare { column, op: "<", value: scalar() },
        FilterOp::Lte => Expr::Compare { column, op: "<=", value: scalar() },
        FilterOp::Like => Expr::Compare { column, op: "LIKE", value: scalar() },
        FilterOp::In => Expr::InList { column, values: list(), negated: false },
        FilterOp::NotIn => Expr::InList { column, values: list(), negated: true },
        FilterOp::IsNull => Expr::IsNull { column, negated: false },
        FilterOp::IsNotNull => Expr::IsNull { column, negated: true },
        FilterOp::Between => {
            let mut bounds = list().into_iter();
            let low = bounds.next().unwrap_or(Value::Null);
            let high = bounds.next().unwrap_or(Value::Null);
            Expr::Between { column, low, high }
        }
    }
}

/// 用户过滤条件按从左到右的顺序组合：((f1 AND f2) OR f3)
fn combine_filters(filters: &[Filter]) -> Option<Expr> {
    let mut iter = filters.iter();
    let first = iter.next()?;
    let mut acc = filter_expr(first);
    for filter in iter {
        let next = filter_expr(filter);
        acc = match filter.connector {
            Connector::And => Expr::And(vec![acc, next]),
            Connector::Or => Expr::Or(vec![acc, next]),
        };
    }
    Some(acc)
}

/// 构造单个分片的 WHERE 条件
pub fn where_clause(query: &FederatedQuery, table: &TableSchema, symbols: &[String]) -> Option<Expr> {
    let mut parts = Vec::new();

    if !symbols.is_empty() {
        parts.push(Expr::InList {
            column: "symbol".to_string(),
            values: symbols.iter().map(|s| Value::Text(s.clone())).collect(),
            negated: false,
        });
    }
    if let Some(time_col) = table.time_column {
        if let Some(start) = query.start {
            parts.push(Expr::Compare { column: time_col.to_string(), op: ">=", value: Value::Integer(start) });
        }
        if let Some(end) = query.end {
            parts.push(Expr::Compare { column: time_col.to_string(), op: "<=", value: Value::Integer(end) });
        }
    }
    if let Some(user) = combine_filters(&query.filters) {
        parts.push(user);
    }

    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(Expr::And(parts)),
    }
}

/// 渲染一个分片上执行的语句；调用前查询必须已通过校验
pub fn build_shard_statement(
    query: &FederatedQuery,
    symbols: &[String],
) -> Result<SqlStatement> {
    let table = query.table()?;
    let source = query.source_name()?;
    let mut sql = String::from("SELECT ");
    let mut params = Vec::new();

    if query.is_aggregate() {
        let mut select: Vec<String> = query.group_by.clone();
        for agg in &query.aggregations {
            select.push(format!("{}({}) AS {}", agg.func.sql(), agg.field, agg.alias()));
        }
        sql.push_str(&select.join(", "));
    } else if query.fields.is_empty() {
        sql.push_str(&table.column_names().join(", "));
    } else {
        let mut select = query.fields.clone();
        select.extend(query.sort_only_fields());
        sql.push_str(&select.join(", "));
    }

    sql.push_str(" FROM ");
    sql.push_str(source);

    if let Some(expr) = where_clause(query, table, symbols) {
        sql.push_str(" WHERE ");
        expr.render(&mut sql, &mut params);
    }

    if query.is_aggregate() && !query.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&query.group_by.join(", "));
    }

    let order: Vec<String> = if !query.sort.is_empty() {
        query
            .sort
            .iter()
            .map(|k| format!("{} {}", k.field, if k.descending { "DESC" } else { "ASC" }))
            .collect()
    } else if query.query_type == crate::federation::query::QueryType::TimeSeries {
        // 时间序列默认按 symbol、时间升序
        table
            .time_column
            .map(|t| vec!["symbol ASC".to_string(), format!("{} ASC", t)])
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    // 每个分片最多取 limit + offset 行，合并后再做全局分页
    if let Some(limit) = query.limit {
        let per_shard = limit.saturating_add(query.offset.unwrap_or(0));
        sql.push_str(" LIMIT ?");
        params.push(Value::Integer(per_shard));
    }

    Ok(SqlStatement { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataCategory;
    use crate::federation::query::{AggFunc, Aggregation, QueryType, SortKey};

    #[test]
    fn test_select_with_filters_and_pagination() {
        let q = FederatedQuery::select(DataCategory::HistoricalBar)
            .with_fields(&["symbol", "close"])
            .with_range(100, 200)
            .with_filter(Filter::new("close", FilterOp::Gt, 10.0))
            .with_filter(Filter::new("volume", FilterOp::IsNull, JsonValue::Null).or())
            .order_by(SortKey::desc("close"))
            .paginate(10, 5);
        q.validate().unwrap();
        let stmt = build_shard_statement(&q, &["A".to_string(), "B".to_string()]).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT symbol, close FROM historical_bars WHERE (symbol IN (?, ?) AND timestamp >= ? \
             AND timestamp <= ? AND (close > ? OR volume IS NULL)) ORDER BY close DESC LIMIT ?"
        );
        assert_eq!(
            stmt.params,
            vec![
                Value::Text("A".into()),
                Value::Text("B".into()),
                Value::Integer(100),
                Value::Integer(200),
                Value::Real(10.0),
                Value::Integer(15),
            ]
        );
    }

    #[test]
    fn test_aggregate_statement() {
        let q = FederatedQuery::new(QueryType::Aggregated, DataCategory::HistoricalBar)
            .with_aggregation(Aggregation::new(AggFunc::Max, "high"))
            .group_by(&["symbol"]);
        let stmt = build_shard_statement(&q, &[]).unwrap();
        assert_eq!(stmt.sql, "SELECT symbol, MAX(high) AS max_high FROM historical_bars GROUP BY symbol");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_sort_column_outside_projection_is_selected() {
        let q = FederatedQuery::select(DataCategory::HistoricalBar)
            .with_fields(&["symbol"])
            .order_by(SortKey::asc("close"))
            .paginate(1, 0);
        q.validate().unwrap();
        let stmt = build_shard_statement(&q, &[]).unwrap();
        assert_eq!(stmt.sql, "SELECT symbol, close FROM historical_bars ORDER BY close ASC LIMIT ?");
    }

    #[test]
    fn test_best_quality_reads_view() {
        let q = FederatedQuery::new(QueryType::TimeSeries, DataCategory::HistoricalBar).best_quality();
        let stmt = build_shard_statement(&q, &["X".to_string()]).unwrap();
        assert!(stmt.sql.contains("FROM best_quality_bars WHERE symbol IN (?)"));
        assert!(stmt.sql.ends_with("ORDER BY symbol ASC, timestamp ASC"));
    }
}
