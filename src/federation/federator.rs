//! 跨分片查询的执行、合并与缓存

use crate::common::{now_millis, AppError, AssetClass, CacheStats, FederationConfig, Result, TtlCache};
use crate::federation::builder::{build_shard_statement, SqlStatement};
use crate::federation::query::{FederatedQuery, QueryType, SortKey};
use crate::shard::records::sql_to_json;
use crate::shard::ShardManager;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// 查询延迟 EWMA 系数
const LATENCY_ALPHA: f64 = 0.2;

/// 合并后的一行，带上来源分片
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FederatedRow {
    pub asset_class: AssetClass,
    #[serde(flatten)]
    pub values: serde_json::Map<String, JsonValue>,
}

impl FederatedRow {
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.values.get(column)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FederatedResult {
    pub rows: Vec<FederatedRow>,
    pub affected_shards: Vec<AssetClass>,
    /// 每个分片的耗时（毫秒）
    pub shard_timings: BTreeMap<AssetClass, f64>,
    pub row_counts: BTreeMap<AssetClass, usize>,
    pub total_ms: f64,
    pub errors: BTreeMap<AssetClass, String>,
    pub warnings: Vec<String>,
    pub cache_hit: bool,
}

impl FederatedResult {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryTypeStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub cache_hits: u64,
    pub avg_latency_ms: f64,
    pub last_query_at: Option<i64>,
}

/// 分片执行计划：类别 → 该分片负责的 symbol
#[derive(Debug, Clone, PartialEq)]
pub struct ShardPlan {
    pub asset_class: AssetClass,
    pub symbols: Vec<String>,
    pub statement: SqlStatement,
}

type ShardOutcome = (AssetClass, f64, Result<Vec<FederatedRow>>);

pub struct QueryFederator {
    manager: Arc<ShardManager>,
    config: FederationConfig,
    semaphore: Arc<Semaphore>,
    cache: TtlCache<String, FederatedResult>,
    stats: Mutex<BTreeMap<QueryType, QueryTypeStats>>,
}

impl std::fmt::Debug for QueryFederator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFederator")
            .field("max_workers", &self.config.max_workers)
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// 在阻塞线程中执行单个分片的语句
fn run_on_shard(manager: &ShardManager, class: AssetClass, statement: &SqlStatement) -> Result<Vec<FederatedRow>> {
    let conn = manager.existing_connection(class)?;
    let mut stmt = conn.prepare(&statement.sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = serde_json::Map::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            let value: Value = row.get(idx)?;
            values.insert(name.clone(), sql_to_json(&value));
        }
        out.push(FederatedRow { asset_class: class, values });
    }
    Ok(out)
}

/// JSON 值比较：null 最小，数字按数值，其余按字符串
fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    let rank = |v: Option<&JsonValue>| match v {
        None | Some(JsonValue::Null) => 0,
        Some(JsonValue::Bool(_)) | Some(JsonValue::Number(_)) => 1,
        Some(_) => 2,
    };
    match (a, b) {
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        (Some(JsonValue::Bool(x)), Some(JsonValue::Bool(y))) => x.cmp(y),
        _ => match rank(a).cmp(&rank(b)) {
            Ordering::Equal => a.map(|v| v.to_string()).cmp(&b.map(|v| v.to_string())),
            other => other,
        },
    }
}

/// 稳定排序，保证相同键的行保持分片顺序
pub fn sort_rows(rows: &mut [FederatedRow], keys: &[SortKey]) {
    rows.sort_by(|a, b| {
        for key in keys {
            let ord = compare_json(a.get(&key.field), b.get(&key.field));
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

impl QueryFederator {
    pub fn new(manager: Arc<ShardManager>, config: FederationConfig) -> Self {
        let workers = config.max_workers.max(1);
        let cache = TtlCache::new(Duration::from_secs(config.cache_ttl_secs), config.cache_capacity);
        Self {
            manager,
            semaphore: Arc::new(Semaphore::new(workers)),
            cache,
            stats: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    /// 解析需要访问的分片以及每个分片负责的 symbol
    pub fn plan(&self, query: &FederatedQuery) -> Result<(Vec<ShardPlan>, Vec<String>)> {
        let mut warnings = Vec::new();
        let classifier = self.manager.classifier();

        let mut by_class: BTreeMap<AssetClass, Vec<String>> = BTreeMap::new();
        for symbol in &query.symbols {
            let class = classifier.classify(symbol).shard_class();
            let bucket = by_class.entry(class).or_default();
            if !bucket.contains(symbol) {
                bucket.push(symbol.clone());
            }
        }

        let classes: Vec<AssetClass> = if !query.asset_classes.is_empty() {
            let mut explicit: Vec<AssetClass> = query.asset_classes.iter().map(|c| c.shard_class()).collect();
            explicit.sort();
            explicit.dedup();
            explicit
        } else if !query.symbols.is_empty() {
            by_class.keys().copied().collect()
        } else {
            self.manager.known_shards()
        };

        let mut plans = Vec::with_capacity(classes.len());
        for class in classes {
            if !self.manager.is_open(class) && !self.manager.shard_path(class).exists() {
                let msg = format!("分片 {} 不存在，已跳过", class);
                debug!(target: "QueryFederator", decision = "shard_skipped", asset_class = %class, "分片不存在");
                warnings.push(msg);
                continue;
            }
            // 显式指定了类别但没有 symbol 被分到该类别时，使用全部 symbol
            let symbols = match by_class.get(&class) {
                Some(list) => list.clone(),
                None => query.symbols.clone(),
            };
            let statement = build_shard_statement(query, &symbols)?;
            plans.push(ShardPlan { asset_class: class, symbols, statement });
        }
        Ok((plans, warnings))
    }

    #[instrument(target = "QueryFederator", skip_all, fields(query_type = %query.query_type, parallel = query.parallel), err)]
    pub async fn execute(&self, query: FederatedQuery) -> Result<FederatedResult> {
        let started = Instant::now();
        let outcome = self.execute_inner(&query, started).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.lock();
        let entry = stats.entry(query.query_type).or_default();
        entry.total += 1;
        entry.last_query_at = Some(now_millis());
        entry.avg_latency_ms = if entry.total == 1 {
            elapsed_ms
        } else {
            LATENCY_ALPHA * elapsed_ms + (1.0 - LATENCY_ALPHA) * entry.avg_latency_ms
        };
        match &outcome {
            Ok(result) if result.cache_hit => {
                entry.cache_hits += 1;
                entry.success += 1;
            }
            Ok(result) if result.errors.is_empty() => entry.success += 1,
            _ => entry.failure += 1,
        }
        outcome
    }

    async fn execute_inner(&self, query: &FederatedQuery, started: Instant) -> Result<FederatedResult> {
        query.validate()?;

        let cache_key = serde_json::to_string(query)?;
        if query.use_cache {
            if let Some(mut cached) = self.cache.get(&cache_key) {
                cached.cache_hit = true;
                debug!(target: "QueryFederator", decision = "cache_hit", rows = cached.rows.len(), "命中查询缓存");
                return Ok(cached);
            }
        }

        let (plans, warnings) = self.plan(query)?;
        let affected: Vec<AssetClass> = plans.iter().map(|p| p.asset_class).collect();

        let outcomes = if query.parallel {
            self.run_parallel(plans).await
        } else {
            self.run_sequential(plans).await
        };

        let mut result = FederatedResult {
            affected_shards: affected,
            warnings,
            ..FederatedResult::default()
        };

        // 按类别顺序拼接，结果与完成顺序无关
        let mut per_class: BTreeMap<AssetClass, Vec<FederatedRow>> = BTreeMap::new();
        for (class, elapsed_ms, outcome) in outcomes {
            result.shard_timings.insert(class, elapsed_ms);
            match outcome {
                Ok(rows) => {
                    result.row_counts.insert(class, rows.len());
                    per_class.insert(class, rows);
                }
                Err(e) => {
                    warn!(
                        target: "QueryFederator",
                        asset_class = %class,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "分片查询失败，已隔离"
                    );
                    result.errors.insert(class, e.to_string());
                }
            }
        }

        let mut rows: Vec<FederatedRow> = per_class.into_values().flatten().collect();
        if !query.sort.is_empty() {
            sort_rows(&mut rows, &query.sort);
        }
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let mut rows: Vec<FederatedRow> = match query.limit {
            Some(limit) => rows.into_iter().skip(offset).take(limit.max(0) as usize).collect(),
            None => rows.into_iter().skip(offset).collect(),
        };
        // 只为排序选出的列不出现在结果里
        let sort_only = query.sort_only_fields();
        if !sort_only.is_empty() {
            for row in &mut rows {
                for field in &sort_only {
                    row.values.remove(field);
                }
            }
        }
        result.rows = rows;
        result.total_ms = started.elapsed().as_secs_f64() * 1000.0;

        info!(
            target: "QueryFederator",
            shards = result.affected_shards.len(),
            rows = result.rows.len(),
            errors = result.errors.len(),
            total_ms = result.total_ms,
            "联邦查询完成"
        );

        if query.use_cache && result.errors.is_empty() {
            self.cache.insert(cache_key, result.clone());
        }
        Ok(result)
    }

    async fn run_parallel(&self, plans: Vec<ShardPlan>) -> Vec<ShardOutcome> {
        let timeout = Duration::from_secs(self.config.shard_timeout_secs.max(1));
        let mut pending = FuturesUnordered::new();

        for plan in plans {
            let manager = Arc::clone(&self.manager);
            let semaphore = Arc::clone(&self.semaphore);
            pending.push(async move {
                let class = plan.asset_class;
                let started = Instant::now();
                let permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(e) => return (class, 0.0, Err(AppError::TaskJoinError(e.to_string()))),
                };
                // 许可随阻塞任务一起释放，超时后后台任务仍占用一个名额
                let task = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    run_on_shard(&manager, plan.asset_class, &plan.statement)
                });
                let outcome = match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(rows)) => rows,
                    Ok(Err(join)) => Err(AppError::TaskJoinError(join.to_string())),
                    Err(_) => Err(AppError::Timeout(format!("分片 {} 查询超过 {:?}", class, timeout))),
                };
                (class, started.elapsed().as_secs_f64() * 1000.0, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = pending.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_sequential(&self, plans: Vec<ShardPlan>) -> Vec<ShardOutcome> {
        let mut outcomes = Vec::with_capacity(plans.len());
        for plan in plans {
            let class = plan.asset_class;
            let manager = Arc::clone(&self.manager);
            let started = Instant::now();
            let outcome = match tokio::task::spawn_blocking(move || {
                run_on_shard(&manager, plan.asset_class, &plan.statement)
            })
            .await
            {
                Ok(rows) => rows,
                Err(join) => Err(AppError::TaskJoinError(join.to_string())),
            };
            outcomes.push((class, started.elapsed().as_secs_f64() * 1000.0, outcome));
        }
        outcomes
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn statistics(&self) -> BTreeMap<QueryType, QueryTypeStats> {
        self.stats.lock().clone()
    }

    /// 按类别名汇总的统计，便于序列化输出
    pub fn statistics_by_name(&self) -> HashMap<String, QueryTypeStats> {
        self.stats
            .lock()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}
