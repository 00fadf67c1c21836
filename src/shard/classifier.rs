//! 交易代码 → 资产类别（分片键）分类器
//!
//! 规则按优先级升序依次匹配，第一个命中的规则决定类别；
//! 全部未命中时返回默认类别，因此分类永远不会失败。

use crate::common::{AssetClass, Result};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// 未命中任何规则时的默认类别
pub const DEFAULT_ASSET_CLASS: AssetClass = AssetClass::EquityDomestic;

/// 内置分类规则：(类别, 正则, 优先级)，匹配对象为去空格并转大写后的代码
const BUILTIN_RULES: &[(AssetClass, &str, u32)] = &[
    (AssetClass::Macro, r"^MACRO[_.:-].+$", 5),
    (AssetClass::Macro, r"^(CN|US|EU)_(CPI|PPI|GDP|PMI|M2|LPR)$", 5),
    (AssetClass::Index, r"^(000\d{3}\.SH|399\d{3}\.SZ|899\d{3}\.BJ)$", 10),
    (AssetClass::Index, r"^\^[A-Z0-9.]+$", 10),
    (AssetClass::Index, r"^(SPX|NDX|DJI|IXIC|HSI|HSCEI|N225)$", 10),
    (AssetClass::Sector, r"^BK\d{4}(\.[A-Z]+)?$", 15),
    (AssetClass::Concept, r"^GN\d{3,6}$", 16),
    (AssetClass::Concept, r"^CONCEPT[_.-].+$", 16),
    (AssetClass::Industry, r"^(SW|CI)\d{6}(\.[A-Z]+)?$", 17),
    (AssetClass::Fund, r"^(15|16|18)\d{4}\.SZ$", 20),
    (AssetClass::Fund, r"^(50|51|52|56|58)\d{4}\.SH$", 20),
    (AssetClass::Options, r"^1000\d{4}\.(SH|SZ)$", 25),
    (AssetClass::Options, r"^[A-Z]{1,2}\d{3,4}-?[CP]-?\d+(\.[A-Z]+)?$", 25),
    (AssetClass::Bond, r"^(11|12)\d{4}\.(SH|SZ)$", 30),
    (AssetClass::Bond, r"^\d{6,9}\.IB$", 30),
    (AssetClass::EquityDomestic, r"^\d{6}\.(SZ|SH|BJ)$", 40),
    (AssetClass::EquityDomestic, r"^(000|001|002|003|300|301|600|601|603|605|688|689)\d{3}$", 40),
    (AssetClass::EquityHk, r"^\d{4,5}\.HK$", 50),
    (AssetClass::EquityHk, r"^HK\.?\d{4,5}$", 50),
    (AssetClass::EquityHk, r"^\d{5}$", 50),
    (AssetClass::Crypto, r"^[A-Z0-9]{2,10}(USDT|BUSD|USDC|FDUSD)$", 60),
    (AssetClass::Crypto, r"^[A-Z0-9]{2,10}[-/_](USDT|USD|USDC|BTC|ETH)$", 60),
    (AssetClass::Crypto, r"^[A-Z0-9]{3,10}(BTC|ETH)$", 60),
    (AssetClass::Futures, r"^[A-Z]{1,2}\d{3,4}(\.[A-Z]{2,5})?$", 70),
    (AssetClass::Futures, r"^[A-Z]{1,2}(88|99|888)(\.[A-Z]{2,5})?$", 70),
    (AssetClass::EquityUs, r"^[A-Z]{1,5}([.-][A-Z])?$", 80),
    (AssetClass::EquityUs, r"^[A-Z]{1,5}\.(US|N|O|OQ)$", 80),
];

/// 交易所/数据源提示 → 类别
const HINT_TABLE: &[(&str, AssetClass)] = &[
    ("SSE", AssetClass::EquityDomestic),
    ("SZSE", AssetClass::EquityDomestic),
    ("BSE", AssetClass::EquityDomestic),
    ("SH", AssetClass::EquityDomestic),
    ("SZ", AssetClass::EquityDomestic),
    ("BJ", AssetClass::EquityDomestic),
    ("NASDAQ", AssetClass::EquityUs),
    ("NYSE", AssetClass::EquityUs),
    ("AMEX", AssetClass::EquityUs),
    ("US", AssetClass::EquityUs),
    ("HKEX", AssetClass::EquityHk),
    ("HK", AssetClass::EquityHk),
    ("BINANCE", AssetClass::Crypto),
    ("OKX", AssetClass::Crypto),
    ("COINBASE", AssetClass::Crypto),
    ("BYBIT", AssetClass::Crypto),
    ("HUOBI", AssetClass::Crypto),
    ("CCXT", AssetClass::Crypto),
    ("CFFEX", AssetClass::Futures),
    ("SHFE", AssetClass::Futures),
    ("DCE", AssetClass::Futures),
    ("CZCE", AssetClass::Futures),
    ("INE", AssetClass::Futures),
    ("GFEX", AssetClass::Futures),
    ("CBOT", AssetClass::Futures),
    ("CME", AssetClass::Futures),
    ("CFETS", AssetClass::Bond),
    ("FRED", AssetClass::Macro),
];

/// 单条分类规则
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub asset_class: AssetClass,
    pub pattern: Regex,
    pub priority: u32,
}

/// 批量分类统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassificationStats {
    pub total: usize,
    pub by_class: BTreeMap<AssetClass, Vec<String>>,
}

impl ClassificationStats {
    pub fn count(&self, class: AssetClass) -> usize {
        self.by_class.get(&class).map(|v| v.len()).unwrap_or(0)
    }
}

pub struct ShardKeyClassifier {
    rules: RwLock<Vec<ClassificationRule>>,
    cache: Mutex<HashMap<String, AssetClass>>,
    default_class: AssetClass,
}

impl std::fmt::Debug for ShardKeyClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardKeyClassifier")
            .field("rules", &self.rules.read().len())
            .field("cached", &self.cache.lock().len())
            .field("default_class", &self.default_class)
            .finish()
    }
}

impl ShardKeyClassifier {
    /// 使用内置规则创建分类器
    pub fn new() -> Result<Self> {
        let mut rules = Vec::with_capacity(BUILTIN_RULES.len());
        for (class, pattern, priority) in BUILTIN_RULES {
            rules.push(ClassificationRule {
                asset_class: *class,
                pattern: Regex::new(pattern)?,
                priority: *priority,
            });
        }
        // 稳定排序，同优先级保持声明顺序
        rules.sort_by_key(|r| r.priority);

        debug!(target: "classifier", rule_count = rules.len(), "分类器规则加载完成");
        Ok(Self {
            rules: RwLock::new(rules),
            cache: Mutex::new(HashMap::new()),
            default_class: DEFAULT_ASSET_CLASS,
        })
    }

    pub fn default_class(&self) -> AssetClass {
        self.default_class
    }

    /// 追加自定义规则，清空缓存使其立即生效
    pub fn add_rule(&self, asset_class: AssetClass, pattern: &str, priority: u32) -> Result<()> {
        let rule = ClassificationRule {
            asset_class,
            pattern: Regex::new(pattern)?,
            priority,
        };

        {
            let mut rules = self.rules.write();
            let pos = rules.partition_point(|r| r.priority <= priority);
            rules.insert(pos, rule);
        }
        self.clear_cache();

        info!(target: "classifier", asset_class = %asset_class, pattern, priority, "新增分类规则");
        Ok(())
    }

    /// 分类单个代码，永不失败
    pub fn classify(&self, symbol: &str) -> AssetClass {
        let key = symbol.trim().to_uppercase();
        if key.is_empty() {
            return self.default_class;
        }

        if let Some(class) = self.cache.lock().get(&key) {
            return *class;
        }

        let class = self.match_rules(&key).unwrap_or(self.default_class);
        self.cache.lock().insert(key, class);
        class
    }

    /// 结合交易所或数据源提示进行分类，提示未知时回退到模式匹配
    pub fn classify_by_hint(&self, symbol: &str, hint: &str) -> AssetClass {
        let normalized = hint.trim().to_uppercase();
        match HINT_TABLE.iter().find(|(name, _)| *name == normalized) {
            Some((_, class)) => *class,
            None => self.classify(symbol),
        }
    }

    pub fn classify_batch<S: AsRef<str>>(&self, symbols: &[S]) -> HashMap<String, AssetClass> {
        symbols
            .iter()
            .map(|s| (s.as_ref().to_string(), self.classify(s.as_ref())))
            .collect()
    }

    /// 按类别对一批代码分组
    pub fn classification_stats<S: AsRef<str>>(&self, symbols: &[S]) -> ClassificationStats {
        let mut stats = ClassificationStats {
            total: symbols.len(),
            ..Default::default()
        };
        for symbol in symbols {
            let class = self.classify(symbol.as_ref());
            stats.by_class.entry(class).or_default().push(symbol.as_ref().to_string());
        }
        stats
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    fn match_rules(&self, key: &str) -> Option<AssetClass> {
        self.rules
            .read()
            .iter()
            .find(|rule| rule.pattern.is_match(key))
            .map(|rule| rule.asset_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ShardKeyClassifier {
        ShardKeyClassifier::new().expect("builtin rules must compile")
    }

    #[test]
    fn test_oracle_table() {
        let c = classifier();
        let cases = [
            ("000001.SZ", AssetClass::EquityDomestic),
            ("600519.SH", AssetClass::EquityDomestic),
            ("AAPL", AssetClass::EquityUs),
            ("BRK.B", AssetClass::EquityUs),
            ("BTCUSDT", AssetClass::Crypto),
            ("eth-usd", AssetClass::Crypto),
            ("IF2401", AssetClass::Futures),
            ("rb2405.SHF", AssetClass::Futures),
            ("00700.HK", AssetClass::EquityHk),
            ("000300.SH", AssetClass::Index),
            ("^GSPC", AssetClass::Index),
            ("510300.SH", AssetClass::Fund),
            ("159915.SZ", AssetClass::Fund),
            ("113050.SH", AssetClass::Bond),
            ("BK0475", AssetClass::Sector),
            ("GN1234", AssetClass::Concept),
            ("SW801010", AssetClass::Industry),
            ("M2405-C-3000", AssetClass::Options),
            ("MACRO_CN_CPI", AssetClass::Macro),
        ];
        for (symbol, expected) in cases {
            assert_eq!(c.classify(symbol), expected, "symbol {}", symbol);
        }
    }

    #[test]
    fn test_totality_on_malformed_input() {
        let c = classifier();
        for symbol in ["", "   ", "!!!", "😀", "a b c", "12345678901234567890"] {
            // 任意输入都必须得到一个类别
            let _ = c.classify(symbol);
        }
        assert_eq!(c.classify(""), DEFAULT_ASSET_CLASS);
        assert_eq!(c.classify("!!!"), DEFAULT_ASSET_CLASS);
    }

    #[test]
    fn test_determinism_and_cache() {
        let c = classifier();
        let first = c.classify("btcusdt");
        let second = c.classify("BTCUSDT");
        assert_eq!(first, second);
        assert_eq!(c.cache_len(), 1);

        c.clear_cache();
        assert_eq!(c.cache_len(), 0);
        assert_eq!(c.classify("BTCUSDT"), first);
    }

    #[test]
    fn test_hint_overrides_pattern() {
        let c = classifier();
        assert_eq!(c.classify_by_hint("ABC", "binance"), AssetClass::Crypto);
        assert_eq!(c.classify_by_hint("AAPL", "unknown-venue"), AssetClass::EquityUs);
        assert_eq!(c.classify_by_hint("rb2405", "SHFE"), AssetClass::Futures);
    }

    #[test]
    fn test_custom_rule_takes_priority() {
        let c = classifier();
        assert_eq!(c.classify("AAPL"), AssetClass::EquityUs);
        c.add_rule(AssetClass::Fund, r"^AAPL$", 1).unwrap();
        assert_eq!(c.classify("AAPL"), AssetClass::Fund);
        assert!(c.add_rule(AssetClass::Fund, r"(unclosed", 1).is_err());
    }

    #[test]
    fn test_stats_group_by_class() {
        let c = classifier();
        let stats = c.classification_stats(&["AAPL", "MSFT", "BTCUSDT", "000001.SZ"]);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.count(AssetClass::EquityUs), 2);
        assert_eq!(stats.count(AssetClass::Crypto), 1);
        assert_eq!(stats.count(AssetClass::EquityDomestic), 1);

        let batch = c.classify_batch(&["IF2401", "00700.HK"]);
        assert_eq!(batch["IF2401"], AssetClass::Futures);
        assert_eq!(batch["00700.HK"], AssetClass::EquityHk);
    }
}
