//! 上游数据源的能力描述与健康信号

use crate::common::{now_millis, AssetClass, DataCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 成功率 EWMA 平滑系数
pub const SUCCESS_RATE_ALPHA: f64 = 0.1;
/// 延迟 EWMA 平滑系数
pub const LATENCY_ALPHA: f64 = 0.3;

/// 数据源描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub asset_classes: BTreeSet<AssetClass>,
    pub categories: BTreeSet<DataCategory>,
    /// 支持的频率，为空表示不限
    #[serde(default)]
    pub frequencies: BTreeSet<String>,
    pub is_available: bool,
    /// 0.0 ~ 1.0
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    /// 0.0 ~ 1.0
    pub quality_score: f64,
    /// 数值越小越优先，用于打破平局
    pub priority: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_checked: Option<i64>,
}

impl SourceDescriptor {
    pub fn new(id: &str, priority: u32) -> Self {
        Self {
            id: id.to_string(),
            asset_classes: BTreeSet::new(),
            categories: BTreeSet::new(),
            frequencies: BTreeSet::new(),
            is_available: true,
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            quality_score: 0.8,
            priority,
            total_requests: 0,
            failed_requests: 0,
            last_checked: None,
        }
    }

    pub fn with_classes(mut self, classes: &[AssetClass]) -> Self {
        self.asset_classes.extend(classes.iter().copied());
        self
    }

    pub fn with_categories(mut self, categories: &[DataCategory]) -> Self {
        self.categories.extend(categories.iter().copied());
        self
    }

    pub fn with_frequencies(mut self, frequencies: &[&str]) -> Self {
        self.frequencies.extend(frequencies.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_signals(mut self, quality_score: f64, avg_latency_ms: f64) -> Self {
        self.quality_score = quality_score.clamp(0.0, 1.0);
        self.avg_latency_ms = avg_latency_ms.max(0.0);
        self
    }

    /// 能否服务该请求（不考虑可用性）
    pub fn supports(&self, asset_class: AssetClass, category: DataCategory, frequency: Option<&str>) -> bool {
        let class_ok = self.asset_classes.contains(&asset_class)
            || self.asset_classes.contains(&asset_class.shard_class());
        let freq_ok = match frequency {
            Some(f) if !self.frequencies.is_empty() => self.frequencies.contains(f),
            _ => true,
        };
        class_ok && self.categories.contains(&category) && freq_ok
    }

    /// 路由置信度
    pub fn confidence(&self) -> f64 {
        0.6 * self.success_rate + 0.4 * self.quality_score
    }

    /// 记录一次请求结果，更新 EWMA 信号
    pub fn record_outcome(&mut self, latency_ms: Option<f64>, success: bool) {
        self.total_requests += 1;
        if !success {
            self.failed_requests += 1;
        }
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = SUCCESS_RATE_ALPHA * sample + (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate;

        if let Some(latency) = latency_ms {
            let latency = latency.max(0.0);
            self.avg_latency_ms = if self.total_requests == 1 && self.avg_latency_ms == 0.0 {
                latency
            } else {
                LATENCY_ALPHA * latency + (1.0 - LATENCY_ALPHA) * self.avg_latency_ms
            };
        }
        self.last_checked = Some(now_millis());
    }
}

/// 内置数据源目录
pub fn default_sources() -> Vec<SourceDescriptor> {
    use AssetClass::*;
    use DataCategory::*;

    let cn_classes = [EquityDomestic, Index, Fund, Bond, Sector, Concept, Industry, Futures, Options, Macro];
    vec![
        SourceDescriptor::new("tushare", 1)
            .with_classes(&cn_classes)
            .with_categories(&[HistoricalBar, Fundamental, AssetCatalog, SectorFlow])
            .with_signals(0.95, 300.0),
        SourceDescriptor::new("wind", 2)
            .with_classes(&[EquityDomestic, EquityHk, Index, Fund, Bond, Futures, Options, Macro])
            .with_categories(&[HistoricalBar, RealtimeQuote, Fundamental, AssetCatalog])
            .with_signals(0.97, 150.0),
        SourceDescriptor::new("akshare", 3)
            .with_classes(&[EquityDomestic, EquityHk, EquityUs, Index, Fund, Sector, Concept, Industry, Futures, Macro])
            .with_categories(&[HistoricalBar, RealtimeQuote, Fundamental, AssetCatalog, SectorFlow])
            .with_signals(0.85, 600.0),
        SourceDescriptor::new("baostock", 4)
            .with_classes(&[EquityDomestic, Index])
            .with_categories(&[HistoricalBar, Fundamental, AssetCatalog])
            .with_frequencies(&["5m", "15m", "30m", "60m", "1d", "1w", "1M"])
            .with_signals(0.9, 500.0),
        SourceDescriptor::new("eastmoney", 5)
            .with_classes(&[EquityDomestic, Index, Fund, Sector, Concept, Industry])
            .with_categories(&[HistoricalBar, RealtimeQuote, Tick, SectorFlow])
            .with_signals(0.8, 250.0),
        SourceDescriptor::new("yfinance", 6)
            .with_classes(&[EquityUs, EquityHk, Index, Fund, Crypto])
            .with_categories(&[HistoricalBar, RealtimeQuote, Fundamental, AssetCatalog])
            .with_signals(0.85, 400.0),
        SourceDescriptor::new("binance", 7)
            .with_classes(&[Crypto])
            .with_categories(&[HistoricalBar, RealtimeQuote, Tick, AssetCatalog])
            .with_signals(0.95, 100.0),
        SourceDescriptor::new("ccxt", 8)
            .with_classes(&[Crypto])
            .with_categories(&[HistoricalBar, RealtimeQuote, Tick])
            .with_signals(0.85, 200.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_updates() {
        let mut d = SourceDescriptor::new("x", 1);
        d.record_outcome(Some(100.0), false);
        assert!((d.success_rate - 0.9).abs() < 1e-9);
        assert_eq!(d.avg_latency_ms, 100.0);

        d.record_outcome(Some(200.0), true);
        assert!((d.success_rate - 0.91).abs() < 1e-9);
        assert!((d.avg_latency_ms - 130.0).abs() < 1e-9);
        assert_eq!(d.total_requests, 2);
        assert_eq!(d.failed_requests, 1);
    }

    #[test]
    fn test_supports_alias_and_frequency() {
        let d = SourceDescriptor::new("x", 1)
            .with_classes(&[AssetClass::Sector])
            .with_categories(&[DataCategory::HistoricalBar])
            .with_frequencies(&["1d"]);
        assert!(d.supports(AssetClass::Concept, DataCategory::HistoricalBar, Some("1d")));
        assert!(!d.supports(AssetClass::Concept, DataCategory::HistoricalBar, Some("1m")));
        assert!(d.supports(AssetClass::Sector, DataCategory::HistoricalBar, None));
        assert!(!d.supports(AssetClass::Crypto, DataCategory::HistoricalBar, None));
    }
}
