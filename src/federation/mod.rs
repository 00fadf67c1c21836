// 跨分片联邦查询
pub mod builder;
pub mod federator;
pub mod query;

pub use builder::{build_shard_statement, SqlStatement};
pub use federator::{FederatedResult, FederatedRow, QueryFederator, QueryTypeStats, ShardPlan};
pub use query::{AggFunc, Aggregation, Connector, FederatedQuery, Filter, FilterOp, QueryType, SortKey};
