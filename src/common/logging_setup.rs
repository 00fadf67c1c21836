//! 统一日志系统初始化模块
//!
//! 控制台输出与滚动文件输出共用同一个业务过滤器，文件层可选JSON格式

use crate::common::{AppError, LoggingConfig, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 构造业务日志过滤器字符串，压低底层库的噪音
pub fn business_filter(log_level: &str) -> String {
    format!("{},rusqlite=warn,r2d2=warn,tokio=warn", log_level)
}

/// 初始化日志系统
///
/// 返回的 guard 必须由 main 持有到进程结束，否则文件日志可能丢失尾部内容
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    if !config.enabled {
        eprintln!("📋 日志系统已禁用");
        return Ok(None);
    }

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("警告：无法创建日志目录 {}: {}", config.log_dir, e);
    }

    let filter_str = business_filter(&config.log_level);

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "shard_store.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.json_file {
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(file_writer)
                .with_filter(EnvFilter::new(&filter_str))
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer)
                .with_filter(EnvFilter::new(&filter_str))
                .boxed(),
        );
    }

    if config.enable_console_output {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_level(true)
                .with_filter(EnvFilter::new(&filter_str))
                .boxed(),
        );
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(target: "logging", log_level = %config.log_level, log_dir = %config.log_dir, "日志系统初始化完成");
    Ok(Some(guard))
}
