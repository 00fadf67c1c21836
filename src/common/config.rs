//! 分片存储系统配置模块

use crate::common::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 系统配置常量
pub mod constants {
    /// 默认分片根目录
    pub const DEFAULT_ROOT_PATH: &str = "data/databases";

    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/ShardStoreConfig.toml";

    /// 连接池大小的允许范围
    pub const MIN_POOL_SIZE: u32 = 5;
    pub const MAX_POOL_SIZE: u32 = 100;

    /// 路由决策与查询结果缓存的默认TTL（秒）
    pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

    /// 查询结果缓存的默认容量
    pub const DEFAULT_QUERY_CACHE_CAPACITY: usize = 100;

    /// 支持的压缩编码
    pub const SUPPORTED_COMPRESSION: &[&str] = &["none", "zstd", "lz4", "snappy", "gzip"];
}

use constants::*;

fn default_root_path() -> String {
    DEFAULT_ROOT_PATH.to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_memory_limit() -> String {
    "256MB".to_string()
}

fn default_thread_count() -> u32 {
    4
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_source_priority() -> Vec<String> {
    ["tushare", "wind", "akshare", "baostock", "eastmoney", "yfinance", "binance", "ccxt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_cache_capacity() -> usize {
    DEFAULT_QUERY_CACHE_CAPACITY
}

fn default_max_workers() -> usize {
    8
}

fn default_shard_timeout_secs() -> u64 {
    30
}

fn default_maintenance_workers() -> usize {
    2
}

fn default_history_limit() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 分片存储配置
    #[serde(default)]
    pub storage: ShardConfig,

    /// 数据源路由配置
    #[serde(default)]
    pub router: RouterConfig,

    /// 跨分片查询配置
    #[serde(default)]
    pub federation: FederationConfig,

    /// 维护任务配置
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 分片配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// 分片文件根目录
    #[serde(default = "default_root_path")]
    pub root_path: String,

    /// 每个分片的连接池大小（5-100）
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// 首次访问时是否自动创建分片
    #[serde(default = "default_true")]
    pub auto_create: bool,

    /// 压缩编码，写入分片元数据
    #[serde(default = "default_compression")]
    pub compression: String,

    /// 每个连接的页缓存上限，例如 "256MB"
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// 每个连接的辅助线程数
    #[serde(default = "default_thread_count")]
    pub thread_count: u32,

    /// 获取连接的超时时间（秒）
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// 严格模式下，OHLC不一致的数据会被拒绝而不只是告警
    #[serde(default)]
    pub strict_validation: bool,

    /// 数据源优先级（越靠前越优先），用于最优行情视图
    #[serde(default = "default_source_priority")]
    pub source_priority: Vec<String>,

    /// 备份目录，默认为 <root_path>/backups
    #[serde(default)]
    pub backup_dir: Option<String>,
}

/// 数据源路由配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// 路由决策缓存TTL（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// 启动时是否注册内置的数据源描述
    #[serde(default = "default_true")]
    pub register_default_sources: bool,
}

/// 跨分片查询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// 并行扇出的最大工作线程数
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// 单个分片查询超时（秒）
    #[serde(default = "default_shard_timeout_secs")]
    pub shard_timeout_secs: u64,

    /// 结果缓存TTL（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// 结果缓存容量
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// 维护任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// 并发执行的维护任务数
    #[serde(default = "default_maintenance_workers")]
    pub max_workers: usize,

    /// 保留的历史任务数量
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志系统总开关
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 日志级别 (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 日志文件目录
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// 是否启用控制台输出
    #[serde(default = "default_true")]
    pub enable_console_output: bool,

    /// 文件日志是否使用JSON格式
    #[serde(default = "default_true")]
    pub json_file: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            pool_size: default_pool_size(),
            auto_create: true,
            compression: default_compression(),
            memory_limit: default_memory_limit(),
            thread_count: default_thread_count(),
            connection_timeout_secs: default_connection_timeout_secs(),
            strict_validation: false,
            source_priority: default_source_priority(),
            backup_dir: None,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            register_default_sources: true,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            shard_timeout_secs: default_shard_timeout_secs(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_capacity: DEFAULT_QUERY_CACHE_CAPACITY,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            max_workers: default_maintenance_workers(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            enable_console_output: true,
            json_file: true,
        }
    }
}

impl ShardConfig {
    /// 创建以指定目录为根的配置，其余使用默认值
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root_path: root.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.root_path)
    }

    pub fn backup_root(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.root().join("backups"),
        }
    }

    /// 解析后的内存上限（字节）
    pub fn memory_limit_bytes(&self) -> Result<u64> {
        parse_byte_size(&self.memory_limit)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root_path.trim().is_empty() {
            return Err(AppError::ConfigError("分片根目录不能为空".to_string()));
        }

        validate_pool_size(self.pool_size)?;

        let codec = self.compression.to_ascii_lowercase();
        if !SUPPORTED_COMPRESSION.contains(&codec.as_str()) {
            return Err(AppError::ConfigError(format!(
                "不支持的压缩编码: {} (可选: {})",
                self.compression,
                SUPPORTED_COMPRESSION.join(", ")
            )));
        }

        if self.memory_limit_bytes()? == 0 {
            return Err(AppError::ConfigError("内存上限必须大于0".to_string()));
        }

        if self.thread_count == 0 {
            return Err(AppError::ConfigError("线程数必须大于0".to_string()));
        }

        if self.connection_timeout_secs == 0 {
            return Err(AppError::ConfigError("连接超时必须大于0".to_string()));
        }

        Ok(())
    }
}

/// 校验连接池大小
pub fn validate_pool_size(pool_size: u32) -> Result<()> {
    if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&pool_size) {
        return Err(AppError::ConfigError(format!(
            "连接池大小必须在 {}-{} 之间，当前为 {}",
            MIN_POOL_SIZE, MAX_POOL_SIZE, pool_size
        )));
    }
    Ok(())
}

/// 解析 "512MB" / "2GB" / "1048576" 形式的字节大小
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let trimmed = value.trim().to_ascii_uppercase();
    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split_at);

    let number: f64 = number
        .parse()
        .map_err(|_| AppError::ConfigError(format!("无效的大小: {}", value)))?;

    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "KB" | "K" | "KIB" => 1024,
        "MB" | "M" | "MIB" => 1024 * 1024,
        "GB" | "G" | "GIB" => 1024 * 1024 * 1024,
        other => {
            return Err(AppError::ConfigError(format!("无效的大小单位: {}", other)));
        }
    };

    Ok((number * multiplier as f64) as u64)
}

impl AppConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 按 SHARD_CONFIG_PATH 环境变量或默认路径加载；文件不存在时使用默认配置
    pub fn load_or_default() -> Result<Self> {
        let path = std::env::var("SHARD_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if Path::new(&path).exists() {
            Self::from_file(&path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::ConfigError(format!("序列化配置失败: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;

        if self.federation.max_workers == 0 {
            return Err(AppError::ConfigError("查询并发数必须大于0".to_string()));
        }

        if self.federation.cache_capacity == 0 {
            return Err(AppError::ConfigError("查询缓存容量必须大于0".to_string()));
        }

        if self.maintenance.max_workers == 0 {
            return Err(AppError::ConfigError("维护任务并发数必须大于0".to_string()));
        }

        if self.maintenance.history_limit == 0 {
            return Err(AppError::ConfigError("历史任务保留数量必须大于0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.root_path, "data/databases");
    }

    #[test]
    fn test_pool_size_bounds() {
        assert!(validate_pool_size(4).is_err());
        assert!(validate_pool_size(5).is_ok());
        assert!(validate_pool_size(100).is_ok());
        assert!(validate_pool_size(101).is_err());
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("512MB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_byte_size("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert!(parse_byte_size("lots").is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [storage]
            root_path = "/tmp/shards"
            pool_size = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.pool_size, 20);
        assert!(config.storage.auto_create);
        assert_eq!(config.federation.cache_capacity, 100);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let mut config = ShardConfig::default();
        config.compression = "brotli".to_string();
        assert!(config.validate().is_err());
    }
}
