//! 分片备份与恢复

use crate::common::{AppError, AssetClass, Result};
use crate::shard::manager::{file_size, remove_shard_files, ShardManager};
use crate::shard::schema::count_objects;
use rusqlite::{Connection, DatabaseName, OpenFlags};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub asset_class: AssetClass,
    pub restored_from: PathBuf,
    pub shard_path: PathBuf,
    /// 覆盖前对原分片做的备份
    pub previous_backup: Option<PathBuf>,
    pub table_count: i64,
}

/// 只读打开备份文件，确认它是完整可读的 SQLite 数据库
fn verify_backup_file(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| AppError::ValidationError(format!("无法打开备份文件 {}: {}", path.display(), e)))?;
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |r| r.get(0))
        .map_err(|e| AppError::ValidationError(format!("备份文件不是有效的数据库 {}: {}", path.display(), e)))?;
    if verdict != "ok" {
        return Err(AppError::ValidationError(format!("备份文件校验失败 {}: {}", path.display(), verdict)));
    }
    Ok(())
}

impl ShardManager {
    /// 备份分片：用 SQLite 在线备份接口从连接池中的连接复制一致快照
    ///
    /// 快照包含尚未检查点的 WAL 内容，备份期间其他连接可以继续读写。
    /// 生成的文件会重新打开校验，校验失败时删除并返回错误。
    #[instrument(target = "ShardBackup", skip(self), err)]
    pub fn backup(&self, asset_class: AssetClass) -> Result<PathBuf> {
        let class = asset_class.shard_class();
        let source = self.shard_path(class);
        if !source.exists() {
            return Err(AppError::ShardNotFound(class.to_string()));
        }

        let backup_dir = self.config().backup_root();
        std::fs::create_dir_all(&backup_dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let target = backup_dir.join(format!("{}_{}.db", class.as_str(), stamp));

        let copied = {
            let conn = self.existing_connection(class)?;
            conn.backup(DatabaseName::Main, &target, None)
                .map_err(AppError::from)
                .and_then(|_| verify_backup_file(&target))
        };
        if let Err(e) = copied {
            if let Err(io) = remove_shard_files(&target) {
                warn!(target: "ShardBackup", backup = %target.display(), error.details = %io, "清理失败的备份文件出错");
            }
            return Err(e);
        }

        info!(
            target: "ShardBackup",
            log_type = "module",
            asset_class = %class,
            backup = %target.display(),
            bytes = file_size(&target),
            "分片备份完成"
        );
        Ok(target)
    }

    /// 从备份恢复分片；已有分片时必须 `force`，并会先备份现有文件
    #[instrument(target = "ShardBackup", skip(self, backup_path), fields(backup = %backup_path.as_ref().display()), err)]
    pub fn restore<P: AsRef<Path>>(
        &self,
        asset_class: AssetClass,
        backup_path: P,
        force: bool,
    ) -> Result<RestoreReport> {
        let class = asset_class.shard_class();
        let backup_path = backup_path.as_ref();
        if !backup_path.exists() {
            return Err(AppError::ValidationError(format!("备份文件不存在: {}", backup_path.display())));
        }
        verify_backup_file(backup_path)?;

        let target = self.shard_path(class);
        let previous_backup = if target.exists() {
            if !force {
                return Err(AppError::ShardExists(class.to_string()));
            }
            Some(self.backup(class)?)
        } else {
            None
        };

        // 替换文件期间不允许任何连接访问该分片
        self.with_shard_offline(class, |shard_file| {
            remove_shard_files(shard_file)?;
            std::fs::copy(backup_path, shard_file)?;
            Ok(())
        })?;

        // 重新打开会再次执行建表建视图，补齐旧备份中缺失的对象
        if let Err(e) = self.open_shard(class, false) {
            warn!(
                target: "ShardBackup",
                asset_class = %class,
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "恢复后的分片校验失败"
            );
            return Err(e);
        }
        let conn = self.acquire_connection(class)?;
        let table_count = count_objects(&conn, "table")?;

        info!(
            target: "ShardBackup",
            log_type = "module",
            asset_class = %class,
            restored_from = %backup_path.display(),
            table_count,
            "分片恢复完成"
        );
        Ok(RestoreReport {
            asset_class: class,
            restored_from: backup_path.to_path_buf(),
            shard_path: target,
            previous_backup,
            table_count,
        })
    }
}
