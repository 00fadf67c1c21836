// 导出模块
pub mod common;
pub mod federation;
pub mod maintenance;
pub mod router;
pub mod shard;

// Re-export 常用类型
pub use common::{AppConfig, AppError, AssetClass, DataCategory, Result};
pub use federation::{FederatedQuery, FederatedResult, QueryFederator};
pub use maintenance::MaintenanceScheduler;
pub use router::{RoutingStrategy, SourceRouter};
pub use shard::{ShardKeyClassifier, ShardManager};
