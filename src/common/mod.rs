// 导出共享模块
pub mod cache;
pub mod config;
pub mod error;
pub mod logging_setup;
pub mod models;

// 重新导出常用类型，方便使用
pub use cache::{CacheStats, TtlCache};
pub use config::{AppConfig, FederationConfig, LoggingConfig, MaintenanceConfig, RouterConfig, ShardConfig};
pub use error::{AppError, Result};
pub use models::{now_millis, AssetClass, DataCategory, HealthStatus};
