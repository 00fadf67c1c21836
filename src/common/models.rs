use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 资产类别，同时也是分片键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    /// 境内股票（沪深北）
    EquityDomestic,
    EquityUs,
    EquityHk,
    Crypto,
    Futures,
    Options,
    Fund,
    Bond,
    Index,
    Sector,
    Concept,
    Industry,
    Macro,
}

impl AssetClass {
    pub const ALL: [AssetClass; 13] = [
        AssetClass::EquityDomestic,
        AssetClass::EquityUs,
        AssetClass::EquityHk,
        AssetClass::Crypto,
        AssetClass::Futures,
        AssetClass::Options,
        AssetClass::Fund,
        AssetClass::Bond,
        AssetClass::Index,
        AssetClass::Sector,
        AssetClass::Concept,
        AssetClass::Industry,
        AssetClass::Macro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::EquityDomestic => "equity_domestic",
            AssetClass::EquityUs => "equity_us",
            AssetClass::EquityHk => "equity_hk",
            AssetClass::Crypto => "crypto",
            AssetClass::Futures => "futures",
            AssetClass::Options => "options",
            AssetClass::Fund => "fund",
            AssetClass::Bond => "bond",
            AssetClass::Index => "index",
            AssetClass::Sector => "sector",
            AssetClass::Concept => "concept",
            AssetClass::Industry => "industry",
            AssetClass::Macro => "macro",
        }
    }

    /// 分片别名映射：板块类的子类型（概念、行业）共用 sector 分片
    pub fn shard_class(&self) -> AssetClass {
        match self {
            AssetClass::Concept | AssetClass::Industry => AssetClass::Sector,
            other => *other,
        }
    }

    /// 所有真实存在的分片（去掉别名后的类别）
    pub fn shard_classes() -> Vec<AssetClass> {
        Self::ALL
            .iter()
            .copied()
            .filter(|c| c.shard_class() == *c)
            .collect()
    }

    /// 分片文件名，由别名映射后的类别名确定
    pub fn shard_file_name(&self) -> String {
        format!("{}.db", self.shard_class().as_str())
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        AssetClass::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .or_else(|| match normalized.as_str() {
                "stock" | "stock_cn" | "a_share" | "equity" => Some(AssetClass::EquityDomestic),
                "us" | "stock_us" => Some(AssetClass::EquityUs),
                "hk" | "stock_hk" => Some(AssetClass::EquityHk),
                "future" => Some(AssetClass::Futures),
                "option" => Some(AssetClass::Options),
                "etf" => Some(AssetClass::Fund),
                _ => None,
            })
            .ok_or_else(|| format!("unknown asset class '{}'", value))
    }
}

/// 数据类别，与资产类别正交；二者共同决定目标表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    HistoricalBar,
    RealtimeQuote,
    Tick,
    Fundamental,
    AssetCatalog,
    SectorFlow,
    QualityLog,
}

impl DataCategory {
    pub const ALL: [DataCategory; 7] = [
        DataCategory::HistoricalBar,
        DataCategory::RealtimeQuote,
        DataCategory::Tick,
        DataCategory::Fundamental,
        DataCategory::AssetCatalog,
        DataCategory::SectorFlow,
        DataCategory::QualityLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::HistoricalBar => "historical_bar",
            DataCategory::RealtimeQuote => "realtime_quote",
            DataCategory::Tick => "tick",
            DataCategory::Fundamental => "fundamental",
            DataCategory::AssetCatalog => "asset_catalog",
            DataCategory::SectorFlow => "sector_flow",
            DataCategory::QualityLog => "quality_log",
        }
    }

    /// 规范表名
    pub fn table_name(&self) -> &'static str {
        match self {
            DataCategory::HistoricalBar => "historical_bars",
            DataCategory::RealtimeQuote => "realtime_quotes",
            DataCategory::Tick => "tick_data",
            DataCategory::Fundamental => "fundamentals",
            DataCategory::AssetCatalog => "asset_catalog",
            DataCategory::SectorFlow => "sector_flows",
            DataCategory::QualityLog => "data_quality_log",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataCategory {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        DataCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized || c.table_name() == normalized)
            .or_else(|| match normalized.as_str() {
                "bar" | "bars" | "kline" | "daily" => Some(DataCategory::HistoricalBar),
                "quote" | "realtime" => Some(DataCategory::RealtimeQuote),
                "catalog" | "basic_info" => Some(DataCategory::AssetCatalog),
                _ => None,
            })
            .ok_or_else(|| format!("unknown data category '{}'", value))
    }
}

/// 分片健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// 当前时间（毫秒时间戳），所有 created_at/updated_at 字段统一使用
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_aliases_share_one_shard() {
        assert_eq!(AssetClass::Concept.shard_class(), AssetClass::Sector);
        assert_eq!(AssetClass::Industry.shard_file_name(), "sector.db");
        assert!(!AssetClass::shard_classes().contains(&AssetClass::Concept));
        assert_eq!(AssetClass::shard_classes().len(), 11);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("equity-us".parse::<AssetClass>().unwrap(), AssetClass::EquityUs);
        assert_eq!("ETF".parse::<AssetClass>().unwrap(), AssetClass::Fund);
        assert_eq!("historical_bars".parse::<DataCategory>().unwrap(), DataCategory::HistoricalBar);
        assert!("weather".parse::<DataCategory>().is_err());
    }
}
