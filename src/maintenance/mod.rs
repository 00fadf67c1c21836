// 分片维护：健康检查、压缩、备份、完整性、清理与统计
pub mod health;
pub mod scheduler;
pub mod task;

pub use scheduler::{MaintenanceScheduler, SchedulerStatistics};
pub use task::{
    HealthSummary, MaintenanceTask, OverallHealth, ShardHealthReport, ShardOutcome, TaskParams, TaskPriority,
    TaskResult, TaskStatus, TaskTarget, TaskType,
};
