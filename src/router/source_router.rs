//! 数据源路由
//!
//! 根据健康度、延迟和质量信号为每个请求挑选有序的数据源列表。

use crate::common::{now_millis, AppError, AssetClass, CacheStats, DataCategory, Result, RouterConfig, TtlCache};
use crate::router::descriptor::{default_sources, SourceDescriptor};
use crate::shard::ShardManager;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// 非 Failover 策略返回的候选数量上限
pub const MAX_CANDIDATES: usize = 3;
const ROUTE_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Fastest,
    MostReliable,
    HighestQuality,
    LoadBalance,
    /// 与 MostReliable 排序相同，但返回完整的候选链
    Failover,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Fastest => "fastest",
            RoutingStrategy::MostReliable => "most_reliable",
            RoutingStrategy::HighestQuality => "highest_quality",
            RoutingStrategy::LoadBalance => "load_balance",
            RoutingStrategy::Failover => "failover",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fastest" => Ok(RoutingStrategy::Fastest),
            "most_reliable" | "reliable" => Ok(RoutingStrategy::MostReliable),
            "highest_quality" | "quality" => Ok(RoutingStrategy::HighestQuality),
            "load_balance" | "round_robin" => Ok(RoutingStrategy::LoadBalance),
            "failover" => Ok(RoutingStrategy::Failover),
            other => Err(format!("unknown routing strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub symbol: String,
    pub category: DataCategory,
    #[serde(default)]
    pub frequency: Option<String>,
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub preferred_sources: Vec<String>,
}

impl RouteRequest {
    pub fn new(symbol: &str, category: DataCategory, strategy: RoutingStrategy) -> Self {
        Self {
            symbol: symbol.to_string(),
            category,
            frequency: None,
            strategy,
            preferred_sources: Vec::new(),
        }
    }

    pub fn with_frequency(mut self, frequency: &str) -> Self {
        self.frequency = Some(frequency.to_string());
        self
    }

    pub fn with_preferred(mut self, sources: &[&str]) -> Self {
        self.preferred_sources = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    fn cache_key(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.preferred_sources.hash(&mut hasher);
        format!(
            "{}|{}|{}|{}|{:x}",
            self.symbol.trim().to_ascii_uppercase(),
            self.category,
            self.frequency.as_deref().unwrap_or("-"),
            self.strategy,
            hasher.finish()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub shard_path: PathBuf,
    /// 有序候选，第一个即 primary
    pub candidates: Vec<String>,
    pub primary: String,
    pub confidence: f64,
    pub estimated_latency_ms: f64,
    pub cache_hit: bool,
    pub strategy: RoutingStrategy,
    pub decided_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchRouteOutcome {
    Routed(RouteDecision),
    Failed {
        symbol: String,
        category: DataCategory,
        error: String,
    },
}

impl BatchRouteOutcome {
    pub fn decision(&self) -> Option<&RouteDecision> {
        match self {
            BatchRouteOutcome::Routed(d) => Some(d),
            BatchRouteOutcome::Failed { .. } => None,
        }
    }
}

/// 数据源探测接口，返回本次探测的延迟（毫秒）
pub trait SourceProbe: Send + Sync {
    fn probe(&self, source: &SourceDescriptor) -> Result<f64>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub source: String,
    pub available: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStatistics {
    pub total_routes: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub per_strategy: BTreeMap<String, u64>,
    pub available_sources: usize,
    pub sources: Vec<SourceDescriptor>,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct RouterCounters {
    total_routes: u64,
    cache_hits: u64,
    failures: u64,
    per_strategy: BTreeMap<String, u64>,
}

pub struct SourceRouter {
    manager: Arc<ShardManager>,
    sources: RwLock<BTreeMap<String, SourceDescriptor>>,
    cache: TtlCache<String, RouteDecision>,
    round_robin: Mutex<HashMap<(AssetClass, DataCategory), usize>>,
    counters: Mutex<RouterCounters>,
}

impl fmt::Debug for SourceRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRouter")
            .field("sources", &self.sources.read().len())
            .field("cached_decisions", &self.cache.len())
            .finish()
    }
}

fn by_f64_desc(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

fn tie_break(a: &SourceDescriptor, b: &SourceDescriptor) -> Ordering {
    a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id))
}

impl SourceRouter {
    pub fn new(manager: Arc<ShardManager>, config: &RouterConfig) -> Self {
        let router = Self {
            manager,
            sources: RwLock::new(BTreeMap::new()),
            cache: TtlCache::new(Duration::from_secs(config.cache_ttl_secs), ROUTE_CACHE_CAPACITY),
            round_robin: Mutex::new(HashMap::new()),
            counters: Mutex::new(RouterCounters::default()),
        };
        if config.register_default_sources {
            for source in default_sources() {
                router.register_source(source);
            }
        }
        router
    }

    /// 注册数据源；重复注册会以新描述覆盖并重置健康信号
    pub fn register_source(&self, descriptor: SourceDescriptor) {
        let id = descriptor.id.clone();
        let replaced = self.sources.write().insert(id.clone(), descriptor).is_some();
        self.invalidate_cache();
        debug!(target: "SourceRouter", decision = "source_registered", source = %id, replaced, "数据源已注册");
    }

    pub fn unregister_source(&self, source_id: &str) -> bool {
        let removed = self.sources.write().remove(source_id).is_some();
        if removed {
            self.invalidate_cache();
            debug!(target: "SourceRouter", decision = "source_unregistered", source = %source_id, "数据源已移除");
        }
        removed
    }

    pub fn source(&self, source_id: &str) -> Option<SourceDescriptor> {
        self.sources.read().get(source_id).cloned()
    }

    pub fn sources(&self) -> Vec<SourceDescriptor> {
        self.sources.read().values().cloned().collect()
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    pub fn route(&self, symbol: &str, category: DataCategory, strategy: RoutingStrategy) -> Result<RouteDecision> {
        self.route_request(&RouteRequest::new(symbol, category, strategy))
    }

    #[instrument(target = "SourceRouter", skip_all, fields(symbol = %request.symbol, category = %request.category, strategy = %request.strategy), err)]
    pub fn route_request(&self, request: &RouteRequest) -> Result<RouteDecision> {
        let cacheable = request.strategy != RoutingStrategy::LoadBalance;
        let key = request.cache_key();

        let cached = if cacheable { self.cache.get(&key) } else { None };
        if let Some(mut decision) = cached {
            decision.cache_hit = true;
            let mut counters = self.counters.lock();
            counters.total_routes += 1;
            counters.cache_hits += 1;
            *counters.per_strategy.entry(request.strategy.to_string()).or_insert(0) += 1;
            return Ok(decision);
        }

        let result = self.decide(request);

        let mut counters = self.counters.lock();
        counters.total_routes += 1;
        *counters.per_strategy.entry(request.strategy.to_string()).or_insert(0) += 1;
        match &result {
            Ok(decision) => {
                drop(counters);
                if cacheable {
                    self.cache.insert(key, decision.clone());
                }
            }
            Err(e) => {
                counters.failures += 1;
                warn!(
                    target: "SourceRouter",
                    symbol = %request.symbol,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "路由失败"
                );
            }
        }
        result
    }

    fn decide(&self, request: &RouteRequest) -> Result<RouteDecision> {
        let asset_class = self.manager.classifier().classify(&request.symbol);
        let shard_path = self.manager.shard_path(asset_class);
        let frequency = request.frequency.as_deref();

        let mut candidates: Vec<SourceDescriptor> = self
            .sources
            .read()
            .values()
            .filter(|s| s.is_available && s.supports(asset_class, request.category, frequency))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(AppError::NoCandidateSource {
                symbol: request.symbol.clone(),
                category: request.category.to_string(),
            });
        }

        match request.strategy {
            RoutingStrategy::Fastest => candidates.sort_by(|a, b| {
                a.avg_latency_ms.total_cmp(&b.avg_latency_ms).then_with(|| tie_break(a, b))
            }),
            RoutingStrategy::MostReliable | RoutingStrategy::Failover => candidates.sort_by(|a, b| {
                by_f64_desc(a.success_rate, b.success_rate).then_with(|| tie_break(a, b))
            }),
            RoutingStrategy::HighestQuality => candidates.sort_by(|a, b| {
                by_f64_desc(a.quality_score, b.quality_score).then_with(|| tie_break(a, b))
            }),
            RoutingStrategy::LoadBalance => {
                candidates.sort_by(tie_break);
                let mut rr = self.round_robin.lock();
                let counter = rr.entry((asset_class.shard_class(), request.category)).or_insert(0);
                let offset = *counter % candidates.len();
                *counter = counter.wrapping_add(1);
                candidates.rotate_left(offset);
            }
        }

        // 调用方指定的数据源（且确实是候选）按指定顺序提到最前
        if !request.preferred_sources.is_empty() {
            let mut preferred = Vec::new();
            for id in &request.preferred_sources {
                if let Some(pos) = candidates.iter().position(|c| &c.id == id) {
                    preferred.push(candidates.remove(pos));
                }
            }
            preferred.extend(candidates);
            candidates = preferred;
        }

        if request.strategy != RoutingStrategy::Failover {
            candidates.truncate(MAX_CANDIDATES);
        }

        let primary = &candidates[0];
        let decision = RouteDecision {
            symbol: request.symbol.clone(),
            asset_class,
            shard_path,
            primary: primary.id.clone(),
            confidence: primary.confidence(),
            estimated_latency_ms: primary.avg_latency_ms,
            candidates: candidates.iter().map(|c| c.id.clone()).collect(),
            cache_hit: false,
            strategy: request.strategy,
            decided_at: now_millis(),
        };
        debug!(
            target: "SourceRouter",
            decision = "route_decided",
            symbol = %decision.symbol,
            asset_class = %decision.asset_class,
            primary = %decision.primary,
            candidates = decision.candidates.len(),
            "路由决策完成"
        );
        Ok(decision)
    }

    /// 批量路由，单个失败不会中断整批
    pub fn batch_route(&self, requests: &[RouteRequest]) -> Vec<BatchRouteOutcome> {
        let outcomes: Vec<BatchRouteOutcome> = requests
            .iter()
            .map(|req| match self.route_request(req) {
                Ok(decision) => BatchRouteOutcome::Routed(decision),
                Err(e) => BatchRouteOutcome::Failed {
                    symbol: req.symbol.clone(),
                    category: req.category,
                    error: e.to_string(),
                },
            })
            .collect();
        let failed = outcomes.iter().filter(|o| o.decision().is_none()).count();
        info!(target: "SourceRouter", total = requests.len(), failed, "批量路由完成");
        outcomes
    }

    /// 更新数据源健康信号
    ///
    /// 可用性发生变化时清空决策缓存；否则只丢弃候选列表里包含该数据源的决策，
    /// 让新的延迟、成功率立即参与排序。
    pub fn update_source_health(
        &self,
        source_id: &str,
        available: bool,
        latency_ms: Option<f64>,
        success: bool,
    ) -> Result<()> {
        let flipped = {
            let mut sources = self.sources.write();
            let source = sources
                .get_mut(source_id)
                .ok_or_else(|| AppError::ValidationError(format!("未注册的数据源: {}", source_id)))?;
            let flipped = source.is_available != available;
            source.is_available = available;
            source.record_outcome(latency_ms, success);
            flipped
        };

        if flipped {
            self.invalidate_cache();
            info!(
                target: "SourceRouter",
                source = %source_id,
                available,
                "数据源可用性变化，已清空路由缓存"
            );
        } else {
            let dropped = self
                .cache
                .retain(|_, decision| !decision.candidates.iter().any(|c| c == source_id));
            if dropped > 0 {
                debug!(
                    target: "SourceRouter",
                    decision = "cache_entries_dropped",
                    source = %source_id,
                    dropped,
                    "数据源健康信号变化，已丢弃相关路由缓存"
                );
            }
        }
        Ok(())
    }

    /// 逐个探测数据源，单个探测失败只影响该数据源
    pub fn probe_sources(&self, probe: &dyn SourceProbe) -> Vec<ProbeOutcome> {
        let snapshot = self.sources();
        let mut outcomes = Vec::with_capacity(snapshot.len());

        for source in snapshot {
            let outcome = match probe.probe(&source) {
                Ok(latency) => ProbeOutcome {
                    source: source.id.clone(),
                    available: true,
                    latency_ms: Some(latency),
                    error: None,
                },
                Err(e) => {
                    warn!(target: "SourceRouter", source = %source.id, error.details = %e, "数据源探测失败");
                    ProbeOutcome {
                        source: source.id.clone(),
                        available: false,
                        latency_ms: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            // 探测期间数据源可能已被移除
            if let Err(e) = self.update_source_health(&source.id, outcome.available, outcome.latency_ms, outcome.available) {
                debug!(target: "SourceRouter", source = %source.id, error.details = %e, "跳过已移除的数据源");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn statistics(&self) -> RouterStatistics {
        let cache = self.cache.stats();
        let sources = self.sources();
        let counters = self.counters.lock();
        RouterStatistics {
            total_routes: counters.total_routes,
            cache_hits: counters.cache_hits,
            failures: counters.failures,
            per_strategy: counters.per_strategy.clone(),
            available_sources: sources.iter().filter(|s| s.is_available).count(),
            sources,
            cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ShardConfig;
    use crate::shard::ShardKeyClassifier;

    fn router(dir: &std::path::Path) -> SourceRouter {
        let manager = ShardManager::new(
            ShardConfig::with_root(dir),
            Arc::new(ShardKeyClassifier::new().unwrap()),
        )
        .unwrap();
        let config = RouterConfig {
            register_default_sources: false,
            ..RouterConfig::default()
        };
        let router = SourceRouter::new(Arc::new(manager), &config);
        for (id, priority, quality, latency) in [("a", 1, 0.7, 300.0), ("b", 2, 0.9, 100.0), ("c", 3, 0.8, 200.0)] {
            router.register_source(
                SourceDescriptor::new(id, priority)
                    .with_classes(&[AssetClass::Crypto])
                    .with_categories(&[DataCategory::HistoricalBar])
                    .with_signals(quality, latency),
            );
        }
        router
    }

    #[test]
    fn test_strategy_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());

        let fastest = r.route("BTCUSDT", DataCategory::HistoricalBar, RoutingStrategy::Fastest).unwrap();
        assert_eq!(fastest.candidates, vec!["b", "c", "a"]);

        let quality = r.route("BTCUSDT", DataCategory::HistoricalBar, RoutingStrategy::HighestQuality).unwrap();
        assert_eq!(quality.primary, "b");

        // 成功率全部相同，按 priority 打破平局
        let reliable = r.route("BTCUSDT", DataCategory::HistoricalBar, RoutingStrategy::MostReliable).unwrap();
        assert_eq!(reliable.candidates, vec!["a", "b", "c"]);
        assert!((reliable.confidence - (0.6 + 0.4 * 0.7)).abs() < 1e-9);
    }

    #[test]
    fn test_load_balance_rotates_and_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        let first = r.route("ETHUSDT", DataCategory::HistoricalBar, RoutingStrategy::LoadBalance).unwrap();
        let second = r.route("ETHUSDT", DataCategory::HistoricalBar, RoutingStrategy::LoadBalance).unwrap();
        assert_eq!(first.primary, "a");
        assert_eq!(second.primary, "b");
        assert!(!second.cache_hit);
    }

    #[test]
    fn test_preferred_sources_and_unknown_preference() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        let req = RouteRequest::new("BTCUSDT", DataCategory::HistoricalBar, RoutingStrategy::Fastest)
            .with_preferred(&["zzz", "a"]);
        let decision = r.route_request(&req).unwrap();
        assert_eq!(decision.candidates, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_no_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        let err = r.route("AAPL", DataCategory::HistoricalBar, RoutingStrategy::Fastest).unwrap_err();
        assert!(matches!(err, AppError::NoCandidateSource { .. }));
        assert_eq!(r.statistics().failures, 1);
    }
}
