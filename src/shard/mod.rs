// 分片存储：分类、建表、连接池与写入
pub mod backup;
pub mod catalog;
pub mod classifier;
pub mod manager;
pub mod records;
pub mod schema;
pub mod upsert;

pub use backup::RestoreReport;
pub use catalog::CatalogUpsertOutcome;
pub use classifier::{ClassificationStats, ShardKeyClassifier};
pub use manager::{ShardConnection, ShardHandle, ShardHealth, ShardManager, ShardStatistics, ShardStats};
pub use records::{BarRecord, CatalogRecord, GenericRecord, QuoteRecord, TableRow};
pub use schema::{TableSchema, BASE_TABLES};
pub use upsert::UpsertReport;
