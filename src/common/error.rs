use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shard initialization failed for {shard}: {reason}")]
    ShardInitError { shard: String, reason: String },

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Shard already exists: {0} (use force to overwrite)")]
    ShardExists(String),

    #[error("Connection pool exhausted for shard {shard} after {timeout_ms}ms")]
    PoolExhausted { shard: String, timeout_ms: u64 },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("No candidate source for {symbol} ({category})")]
    NoCandidateSource { symbol: String, category: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task state for {task_id}: {reason}")]
    InvalidTaskState { task_id: String, reason: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Task join error: {0}")]
    TaskJoinError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlDeError(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    #[error("Pattern error: {0}")]
    RegexError(#[from] regex::Error),
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志中的错误分类
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 配置相关
            AppError::ConfigError(_) => "storage_configuration_invalid",
            AppError::TomlDeError(_) | AppError::TomlSerError(_) => "storage_configuration_unreadable",
            AppError::RegexError(_) => "classifier_rule_invalid",

            // 分片生命周期
            AppError::ShardInitError { .. } => "shard_initialization_failed",
            AppError::ShardNotFound(_) => "shard_missing",
            AppError::ShardExists(_) => "shard_overwrite_refused",

            // 存储读写
            AppError::PoolExhausted { .. } => "shard_pool_exhausted",
            AppError::PoolError(_) => "shard_connection_failed",
            AppError::DatabaseError(_) => "shard_persistence_failed",
            AppError::SqliteError(_) => "shard_storage_operation_failed",

            // 请求校验
            AppError::ValidationError(_) => "request_validation_failed",
            AppError::NoCandidateSource { .. } => "source_routing_failed",

            // 维护任务
            AppError::TaskNotFound(_) => "maintenance_task_missing",
            AppError::InvalidTaskState { .. } => "maintenance_task_state_invalid",
            AppError::TaskJoinError(_) => "worker_task_failed",

            AppError::Timeout(_) => "operation_timed_out",
            AppError::IoError(_) => "shard_file_operation_failed",
            AppError::JsonError(_) => "payload_serialization_failed",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 连接池耗尽、数据库锁争用和超时属于瞬时错误，其余错误重试无意义
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::PoolExhausted { .. } | AppError::Timeout(_) => true,
            AppError::PoolError(_) => true,
            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            }
            AppError::SqliteError(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            AppError::IoError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
