//! 维护任务模型

use crate::common::{now_millis, AssetClass};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    HealthCheck,
    Vacuum,
    Backup,
    IntegrityCheck,
    DataCleanup,
    StatisticsUpdate,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::HealthCheck => "health_check",
            TaskType::Vacuum => "vacuum",
            TaskType::Backup => "backup",
            TaskType::IntegrityCheck => "integrity_check",
            TaskType::DataCleanup => "data_cleanup",
            TaskType::StatisticsUpdate => "statistics_update",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "health_check" | "health" => Ok(TaskType::HealthCheck),
            "vacuum" => Ok(TaskType::Vacuum),
            "backup" => Ok(TaskType::Backup),
            "integrity_check" | "integrity" => Ok(TaskType::IntegrityCheck),
            "data_cleanup" | "cleanup" => Ok(TaskType::DataCleanup),
            "statistics_update" | "statistics" | "analyze" => Ok(TaskType::StatisticsUpdate),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

/// 优先级，数值越大越先调度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(format!("unknown task priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// 状态只能单向流转
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// 任务目标：单个分片或全部已知分片
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTarget {
    All,
    Shard(AssetClass),
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskTarget::All => f.write_str("all"),
            TaskTarget::Shard(class) => write!(f, "{}", class),
        }
    }
}

impl FromStr for TaskTarget {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().eq_ignore_ascii_case("all") {
            return Ok(TaskTarget::All);
        }
        value.parse::<AssetClass>().map(|c| TaskTarget::Shard(c.shard_class()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// 健康检查时是否运行 PRAGMA integrity_check
    #[serde(default)]
    pub full_check: bool,
    /// 压缩后是否执行 ANALYZE
    #[serde(default = "default_analyze")]
    pub analyze: bool,
    /// 数据清理的保留天数
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_analyze() -> bool {
    true
}

fn default_retention_days() -> u32 {
    365
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            full_check: false,
            analyze: default_analyze(),
            retention_days: default_retention_days(),
        }
    }
}

impl TaskParams {
    pub fn full_check(mut self) -> Self {
        self.full_check = true;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }
}

/// 单个分片的健康报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardHealthReport {
    pub asset_class: Option<AssetClass>,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub table_count: i64,
    pub index_count: i64,
    pub record_count: i64,
    pub page_count: i64,
    pub freelist_count: i64,
    /// freelist / page_count
    pub fragmentation: f64,
    pub integrity_ok: Option<bool>,
    pub issues: Vec<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallHealth::Excellent => "excellent",
            OverallHealth::Good => "good",
            OverallHealth::Fair => "fair",
            OverallHealth::Poor => "poor",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: OverallHealth,
    pub average_score: f64,
    pub total_issues: usize,
    pub shard_count: usize,
    pub total_size_bytes: u64,
    pub total_records: i64,
    pub shards: Vec<ShardHealthReport>,
    pub checked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacuumReport {
    pub asset_class: AssetClass,
    pub bytes_before: i64,
    pub bytes_after: i64,
    pub reclaimed_bytes: i64,
    pub analyzed: bool,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub asset_class: AssetClass,
    pub ok: bool,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub asset_class: AssetClass,
    pub cutoff: i64,
    pub deleted: std::collections::BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub asset_class: AssetClass,
    pub record_counts: std::collections::BTreeMap<String, i64>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupReport {
    pub asset_class: AssetClass,
    pub backup_path: PathBuf,
    pub size_bytes: u64,
}

/// 单个分片的执行结果，失败的分片记录错误而不影响其他分片
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardOutcome {
    Health(ShardHealthReport),
    Vacuum(VacuumReport),
    Backup(BackupReport),
    Integrity(IntegrityReport),
    Cleanup(CleanupReport),
    Statistics(StatisticsReport),
    Error { asset_class: AssetClass, error: String },
}

impl ShardOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ShardOutcome::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    HealthCheck(HealthSummary),
    PerShard(Vec<ShardOutcome>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub id: String,
    pub task_type: TaskType,
    pub target: TaskTarget,
    pub priority: TaskPriority,
    pub params: TaskParams,
    pub status: TaskStatus,
    /// 0-100
    pub progress: f64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

impl MaintenanceTask {
    pub fn new(id: String, task_type: TaskType, target: TaskTarget, priority: TaskPriority, params: TaskParams) -> Self {
        Self {
            id,
            task_type,
            target,
            priority,
            params,
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: now_millis(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_one_directional() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_parse_target_and_type() {
        assert_eq!("all".parse::<TaskTarget>().unwrap(), TaskTarget::All);
        assert_eq!("concept".parse::<TaskTarget>().unwrap(), TaskTarget::Shard(AssetClass::Sector));
        assert_eq!("cleanup".parse::<TaskType>().unwrap(), TaskType::DataCleanup);
        assert!(TaskPriority::Critical > TaskPriority::Low);
    }
}
