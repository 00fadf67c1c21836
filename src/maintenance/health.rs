//! 分片级维护操作，全部为阻塞调用，由调度器放到阻塞线程池执行

use crate::common::{now_millis, AssetClass, Result};
use crate::maintenance::task::{
    BackupReport, CleanupReport, HealthSummary, IntegrityReport, OverallHealth, ShardHealthReport, StatisticsReport,
    VacuumReport,
};
use crate::shard::manager::file_size;
use crate::shard::schema::count_objects;
use crate::shard::{ShardManager, BASE_TABLES};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

const GIB: u64 = 1024 * 1024 * 1024;
const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// 碎片率超过该值记为问题
const FRAGMENTATION_WARN: f64 = 0.25;

fn pragma_i64(conn: &Connection, pragma: &str) -> Result<i64> {
    Ok(conn.query_row(&format!("PRAGMA {}", pragma), [], |row| row.get(0))?)
}

fn allocated_bytes(conn: &Connection) -> Result<i64> {
    Ok(pragma_i64(conn, "page_count")? * pragma_i64(conn, "page_size")?)
}

fn integrity_messages(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut messages = Vec::new();
    for message in rows {
        messages.push(message?);
    }
    Ok(messages)
}

/// 性能分数：从 100 开始，按体积、碎片率和问题数扣分
pub fn performance_score(size_bytes: u64, fragmentation: f64, issue_count: usize) -> f64 {
    let mut score = 100.0;
    if size_bytes > 10 * GIB {
        score -= 20.0;
    } else if size_bytes > GIB {
        score -= 10.0;
    }
    score -= (fragmentation * 100.0).min(30.0);
    score -= 10.0 * issue_count as f64;
    score.clamp(0.0, 100.0)
}

/// 综合状态由平均分和问题总数决定
pub fn overall_status(average_score: f64, total_issues: usize) -> OverallHealth {
    if average_score >= 90.0 && total_issues == 0 {
        OverallHealth::Excellent
    } else if average_score >= 75.0 && total_issues <= 2 {
        OverallHealth::Good
    } else if average_score >= 50.0 {
        OverallHealth::Fair
    } else {
        OverallHealth::Poor
    }
}

pub fn summarize(shards: Vec<ShardHealthReport>) -> HealthSummary {
    let total_issues: usize = shards.iter().map(|s| s.issues.len()).sum();
    let average_score = if shards.is_empty() {
        100.0
    } else {
        shards.iter().map(|s| s.score).sum::<f64>() / shards.len() as f64
    };
    HealthSummary {
        status: overall_status(average_score, total_issues),
        average_score,
        total_issues,
        shard_count: shards.len(),
        total_size_bytes: shards.iter().map(|s| s.size_bytes).sum(),
        total_records: shards.iter().map(|s| s.record_count).sum(),
        shards,
        checked_at: now_millis(),
    }
}

/// 单个分片的健康报告；连接失败时返回一个零分报告而不是错误
pub fn shard_health_report(manager: &ShardManager, class: AssetClass, full_check: bool) -> ShardHealthReport {
    let path = manager.shard_path(class);
    let mut report = ShardHealthReport {
        asset_class: Some(class),
        size_bytes: file_size(&path),
        file_path: path,
        ..ShardHealthReport::default()
    };

    let inspect = |report: &mut ShardHealthReport| -> Result<()> {
        let conn = manager.existing_connection(class)?;
        report.table_count = count_objects(&conn, "table")?;
        report.index_count = count_objects(&conn, "index")?;
        report.page_count = pragma_i64(&conn, "page_count")?;
        report.freelist_count = pragma_i64(&conn, "freelist_count")?;
        report.fragmentation = if report.page_count > 0 {
            report.freelist_count as f64 / report.page_count as f64
        } else {
            0.0
        };
        for table in BASE_TABLES {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name), [], |row| row.get(0))?;
            report.record_count += count;
        }
        if full_check {
            let messages = integrity_messages(&conn)?;
            let ok = messages.len() == 1 && messages[0] == "ok";
            if !ok {
                report.issues.extend(messages.into_iter().map(|m| format!("integrity: {}", m)));
            }
            report.integrity_ok = Some(ok);
        }
        Ok(())
    };

    match inspect(&mut report) {
        Ok(()) => {
            if report.table_count < BASE_TABLES.len() as i64 {
                report
                    .issues
                    .push(format!("表数量不足: {} < {}", report.table_count, BASE_TABLES.len()));
            }
            if report.fragmentation > FRAGMENTATION_WARN {
                report.issues.push(format!("碎片率过高: {:.1}%", report.fragmentation * 100.0));
            }
            report.score = performance_score(report.size_bytes, report.fragmentation, report.issues.len());
        }
        Err(e) => {
            warn!(
                target: "MaintenanceScheduler",
                asset_class = %class,
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "分片健康检查失败"
            );
            report.issues.push(format!("unreachable: {}", e));
            report.score = 0.0;
        }
    }
    report
}

/// 压缩分片，记录回收的空间
pub fn vacuum_shard(manager: &ShardManager, class: AssetClass, analyze: bool) -> Result<VacuumReport> {
    let started = Instant::now();
    let conn = manager.existing_connection(class)?;
    let bytes_before = allocated_bytes(&conn)?;
    conn.execute_batch("VACUUM")?;
    if analyze {
        conn.execute_batch("ANALYZE")?;
    }
    let bytes_after = allocated_bytes(&conn)?;
    let report = VacuumReport {
        asset_class: class,
        bytes_before,
        bytes_after,
        reclaimed_bytes: (bytes_before - bytes_after).max(0),
        analyzed: analyze,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    };
    info!(
        target: "MaintenanceScheduler",
        asset_class = %class,
        reclaimed_bytes = report.reclaimed_bytes,
        elapsed_ms = report.elapsed_ms,
        "分片压缩完成"
    );
    Ok(report)
}

pub fn backup_shard(manager: &ShardManager, class: AssetClass) -> Result<BackupReport> {
    let backup_path = manager.backup(class)?;
    Ok(BackupReport {
        asset_class: class,
        size_bytes: file_size(&backup_path),
        backup_path,
    })
}

pub fn integrity_check(manager: &ShardManager, class: AssetClass) -> Result<IntegrityReport> {
    let conn = manager.existing_connection(class)?;
    let messages = integrity_messages(&conn)?;
    let ok = messages.len() == 1 && messages[0] == "ok";
    if !ok {
        warn!(target: "MaintenanceScheduler", asset_class = %class, problems = messages.len(), "完整性检查发现问题");
    }
    Ok(IntegrityReport { asset_class: class, ok, messages })
}

/// 删除早于保留期的行；没有时间列的表（资产目录）不参与
pub fn cleanup_shard(manager: &ShardManager, class: AssetClass, retention_days: u32) -> Result<CleanupReport> {
    let cutoff = now_millis() - i64::from(retention_days) * MS_PER_DAY;
    let conn = manager.existing_connection(class)?;
    let tx = conn.unchecked_transaction()?;
    let mut deleted = BTreeMap::new();
    for table in BASE_TABLES {
        let Some(time_col) = table.time_column else {
            continue;
        };
        let removed = tx.execute(
            &format!("DELETE FROM {} WHERE {} < ?1", table.name, time_col),
            [cutoff],
        )?;
        if removed > 0 {
            debug!(target: "MaintenanceScheduler", asset_class = %class, table = table.name, removed, "过期数据已删除");
        }
        deleted.insert(table.name.to_string(), removed);
    }
    tx.commit()?;
    Ok(CleanupReport { asset_class: class, cutoff, deleted })
}

pub fn update_statistics(manager: &ShardManager, class: AssetClass) -> Result<StatisticsReport> {
    let started = Instant::now();
    {
        let conn = manager.existing_connection(class)?;
        conn.execute_batch("ANALYZE")?;
    }
    let (_, record_counts) = manager.count_records(class)?;
    Ok(StatisticsReport {
        asset_class: class,
        record_counts,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(score: f64, issues: usize) -> ShardHealthReport {
        ShardHealthReport {
            score,
            issues: (0..issues).map(|i| format!("issue {}", i)).collect(),
            ..ShardHealthReport::default()
        }
    }

    #[test]
    fn test_score_penalties() {
        assert_eq!(performance_score(1024, 0.0, 0), 100.0);
        assert_eq!(performance_score(2 * GIB, 0.0, 0), 90.0);
        assert_eq!(performance_score(20 * GIB, 0.0, 0), 80.0);
        assert!((performance_score(0, 0.1, 1) - 80.0).abs() < 1e-9);
        assert_eq!(performance_score(20 * GIB, 0.9, 10), 0.0);
    }

    #[test]
    fn test_overall_status_thresholds() {
        assert_eq!(summarize(vec![report(100.0, 0)]).status, OverallHealth::Excellent);
        assert_eq!(summarize(vec![report(95.0, 1)]).status, OverallHealth::Good);
        assert_eq!(summarize(vec![report(80.0, 3)]).status, OverallHealth::Fair);
        assert_eq!(summarize(vec![report(40.0, 0), report(50.0, 0)]).status, OverallHealth::Poor);
        assert_eq!(summarize(Vec::new()).status, OverallHealth::Excellent);
    }
}
