//! 分片生命周期管理
//!
//! 每个资产类别一个 SQLite 文件、一个 r2d2 连接池。分片在第一次使用时惰性创建，
//! 初始化（建表、建视图、写元数据）在同一个事务内完成，失败时删除新建的文件。

use crate::common::config::validate_pool_size;
use crate::common::{now_millis, AppError, AssetClass, DataCategory, HealthStatus, Result, ShardConfig};
use crate::shard::catalog::{bulk_merge_catalog, upsert_catalog_entry, CatalogUpsertOutcome};
use crate::shard::classifier::ShardKeyClassifier;
use crate::shard::records::{CatalogRecord, TableRow};
use crate::shard::schema::{
    self, count_objects, initialize_schema, schema_for_category, table_schema, ASSET_CATALOG, BASE_TABLES,
};
use crate::shard::upsert::bulk_upsert_rows;
use parking_lot::{Mutex, RwLock};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

pub type ShardPool = Pool<SqliteConnectionManager>;
/// 作用域连接，drop 时归还连接池
pub type ShardConnection = PooledConnection<SqliteConnectionManager>;

/// 运行时可调整的设置，持久化在分片根目录下
pub const SETTINGS_FILE: &str = "shard_settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShardSettings {
    pool_size: u32,
}

/// 分片运行时信息
#[derive(Debug, Clone, Serialize)]
pub struct ShardHandle {
    pub asset_class: AssetClass,
    pub file_path: PathBuf,
    pub created_at: i64,
    pub last_accessed: i64,
    pub size_bytes: u64,
    pub table_count: i64,
    pub record_count: i64,
    pub health_status: HealthStatus,
    pub known_data_sources: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardHealth {
    pub asset_class: AssetClass,
    pub status: HealthStatus,
    pub file_path: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
    pub table_count: i64,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub checked_at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardStats {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub table_count: i64,
    pub record_count: i64,
    pub per_table: BTreeMap<String, i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardStatistics {
    pub shard_count: usize,
    pub total_size_bytes: u64,
    pub total_records: i64,
    pub per_class: BTreeMap<AssetClass, ShardStats>,
}

pub(crate) fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// 删除数据库文件及其 WAL/SHM 附属文件
pub(crate) fn remove_shard_files(path: &Path) -> std::io::Result<()> {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

pub struct ShardManager {
    config: RwLock<ShardConfig>,
    classifier: Arc<ShardKeyClassifier>,
    pools: RwLock<HashMap<AssetClass, ShardPool>>,
    handles: RwLock<HashMap<AssetClass, ShardHandle>>,
    /// 串行化分片初始化，避免同一文件被并发初始化
    init_lock: Mutex<()>,
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("root", &self.config.read().root_path)
            .field("open_pools", &self.pools.read().len())
            .finish()
    }
}

impl ShardManager {
    /// 创建管理器：校验配置、创建根目录与备份目录、加载持久化的连接池大小
    #[instrument(target = "ShardManager", skip_all, fields(root = %config.root_path), err)]
    pub fn new(mut config: ShardConfig, classifier: Arc<ShardKeyClassifier>) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(config.root())?;
        std::fs::create_dir_all(config.backup_root())?;

        let settings_path = config.root().join(SETTINGS_FILE);
        if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            let settings: ShardSettings = toml::from_str(&content)?;
            validate_pool_size(settings.pool_size)?;
            debug!(
                target: "ShardManager",
                decision = "pool_size_restored",
                pool_size = settings.pool_size,
                "使用持久化的连接池大小"
            );
            config.pool_size = settings.pool_size;
        }

        info!(target: "ShardManager", log_type = "module", root = %config.root_path, pool_size = config.pool_size, "分片管理器已创建");

        Ok(Self {
            config: RwLock::new(config),
            classifier,
            pools: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            init_lock: Mutex::new(()),
        })
    }

    pub fn classifier(&self) -> &Arc<ShardKeyClassifier> {
        &self.classifier
    }

    /// 当前配置快照
    pub fn config(&self) -> ShardConfig {
        self.config.read().clone()
    }

    pub fn shard_path(&self, asset_class: AssetClass) -> PathBuf {
        self.config.read().root().join(asset_class.shard_file_name())
    }

    /// symbol 所属的分片类别
    pub fn shard_for_symbol(&self, symbol: &str) -> AssetClass {
        self.classifier.classify(symbol).shard_class()
    }

    pub fn pool_size(&self) -> u32 {
        self.config.read().pool_size
    }

    /// 修改连接池大小并持久化；只影响之后新建的连接池
    #[instrument(target = "ShardManager", skip(self), err)]
    pub fn set_pool_size(&self, pool_size: u32) -> Result<()> {
        validate_pool_size(pool_size)?;

        let settings_path = {
            let mut config = self.config.write();
            config.pool_size = pool_size;
            config.root().join(SETTINGS_FILE)
        };
        let content = toml::to_string_pretty(&ShardSettings { pool_size })?;
        std::fs::write(&settings_path, content)?;

        info!(target: "ShardManager", pool_size, settings = %settings_path.display(), "连接池大小已更新");
        Ok(())
    }

    /// 获取或创建分片，是否创建由配置中的 auto_create 决定
    pub fn get_or_create_shard(&self, asset_class: AssetClass) -> Result<PathBuf> {
        let auto_create = self.config.read().auto_create;
        self.open_shard(asset_class, auto_create)
    }

    /// 打开分片；文件不存在且 `auto_create` 为 false 时返回 ShardNotFound
    pub fn open_shard(&self, asset_class: AssetClass, auto_create: bool) -> Result<PathBuf> {
        let class = asset_class.shard_class();
        let path = self.shard_path(class);

        if self.pools.read().contains_key(&class) {
            self.touch(class);
            return Ok(path);
        }

        let _init = self.init_lock.lock();
        // 拿到锁后再检查一次
        if self.pools.read().contains_key(&class) {
            self.touch(class);
            return Ok(path);
        }

        let existed = path.exists();
        if !existed && !auto_create {
            return Err(AppError::ShardNotFound(class.to_string()));
        }

        match self.initialize_shard(class, &path) {
            Ok((pool, handle)) => {
                self.pools.write().insert(class, pool);
                self.handles.write().insert(class, handle);
                info!(
                    target: "ShardManager",
                    log_type = "module",
                    asset_class = %class,
                    path = %path.display(),
                    created = !existed,
                    "✅ 分片已就绪"
                );
                Ok(path)
            }
            Err(e) => {
                error!(
                    target: "ShardManager",
                    asset_class = %class,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "分片初始化失败"
                );
                if !existed {
                    if let Err(io) = remove_shard_files(&path) {
                        warn!(target: "ShardManager", path = %path.display(), error.details = %io, "清理未完成的分片文件失败");
                    }
                }
                Err(e)
            }
        }
    }

    fn build_pool(&self, path: &Path) -> Result<ShardPool> {
        let config = self.config.read().clone();
        let cache_kib = (config.memory_limit_bytes()? / 1024).max(1024);
        let busy_ms = config.connection_timeout_secs.saturating_mul(1000);
        let threads = config.thread_count;

        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA cache_size = -{};
                 PRAGMA busy_timeout = {};
                 PRAGMA threads = {};",
                cache_kib, busy_ms, threads
            ))
        });

        Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .build(manager)
            .map_err(AppError::from)
    }

    fn initialize_shard(&self, class: AssetClass, path: &Path) -> Result<(ShardPool, ShardHandle)> {
        let init_err = |reason: String| AppError::ShardInitError {
            shard: class.to_string(),
            reason,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| init_err(format!("创建目录失败: {}", e)))?;
        }

        let pool = self.build_pool(path).map_err(|e| init_err(e.to_string()))?;
        let (compression, priority) = {
            let config = self.config.read();
            (config.compression.clone(), config.source_priority.clone())
        };

        let conn = pool.get().map_err(|e| init_err(e.to_string()))?;
        initialize_schema(&conn, class, &compression, &priority)?;

        let created_at = schema::read_metadata(&conn, "created_at")
            .map_err(|e| init_err(e.to_string()))?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or_else(now_millis);
        let table_count = count_objects(&conn, "table").map_err(|e| init_err(e.to_string()))?;
        drop(conn);

        let now = now_millis();
        let handle = ShardHandle {
            asset_class: class,
            file_path: path.to_path_buf(),
            created_at,
            last_accessed: now,
            size_bytes: file_size(path),
            table_count,
            record_count: 0,
            health_status: HealthStatus::Healthy,
            known_data_sources: BTreeSet::new(),
        };
        Ok((pool, handle))
    }

    fn touch(&self, class: AssetClass) {
        if let Some(handle) = self.handles.write().get_mut(&class) {
            handle.last_accessed = now_millis();
        }
    }

    fn pool(&self, class: AssetClass) -> Option<ShardPool> {
        self.pools.read().get(&class).cloned()
    }

    /// 获取分片连接（作用域内持有，drop 时归还）
    pub fn acquire_connection(&self, asset_class: AssetClass) -> Result<ShardConnection> {
        let class = asset_class.shard_class();
        self.get_or_create_shard(class)?;
        let pool = self
            .pool(class)
            .ok_or_else(|| AppError::ShardNotFound(class.to_string()))?;

        let started = Instant::now();
        match pool.get() {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let state = pool.state();
                if state.idle_connections == 0 && state.connections >= pool.max_size() {
                    let timeout_ms = started.elapsed().as_millis() as u64;
                    warn!(
                        target: "ShardManager",
                        asset_class = %class,
                        max_size = pool.max_size(),
                        timeout_ms,
                        "连接池已耗尽"
                    );
                    Err(AppError::PoolExhausted {
                        shard: class.to_string(),
                        timeout_ms,
                    })
                } else {
                    Err(AppError::PoolError(e))
                }
            }
        }
    }

    /// 对已打开的分片获取连接，不触发创建
    pub(crate) fn existing_connection(&self, asset_class: AssetClass) -> Result<ShardConnection> {
        let class = asset_class.shard_class();
        self.open_shard(class, false)?;
        self.acquire_connection(class)
    }

    /// 批量写入；`table_name` 为空时使用类别对应的规范表
    #[instrument(target = "ShardManager", skip(self, rows), fields(row_count = rows.len()), err)]
    pub fn bulk_upsert<R: TableRow>(
        &self,
        rows: &[R],
        asset_class: AssetClass,
        category: DataCategory,
        table_name: Option<&str>,
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let table = match table_name {
            Some(name) => table_schema(name)
                .ok_or_else(|| AppError::ValidationError(format!("未知的目标表: {}", name)))?,
            None => schema_for_category(category),
        };
        let class = asset_class.shard_class();
        let strict = self.config.read().strict_validation;

        let conn = self.acquire_connection(class)?;
        // 目录表按合并规则写入，数组并集、粘性字段与版本号都不会被整行覆盖
        let (rows_written, warnings, sources) = if table.name == ASSET_CATALOG.name {
            let outcomes = bulk_merge_catalog(&conn, rows, asset_class, strict)?;
            let sources: BTreeSet<String> = rows
                .iter()
                .flat_map(|r| CatalogRecord::from_columns(r.columns()).data_sources)
                .collect();
            (outcomes.len(), 0, sources)
        } else {
            let report = bulk_upsert_rows(&conn, table, rows, strict)?;
            (report.rows_written, report.warnings.len(), report.data_sources)
        };
        drop(conn);

        let path = self.shard_path(class);
        if let Some(handle) = self.handles.write().get_mut(&class) {
            handle.last_accessed = now_millis();
            handle.size_bytes = file_size(&path);
            handle.known_data_sources.extend(sources);
        }

        info!(
            target: "ShardManager",
            asset_class = %class,
            table = table.name,
            rows = rows_written,
            warnings,
            "批量写入完成"
        );
        Ok(rows_written)
    }

    /// 插入或合并资产目录条目，写入 symbol 所在类别的分片
    pub fn upsert_catalog_entry(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        entry: &CatalogRecord,
    ) -> Result<CatalogUpsertOutcome> {
        let class = asset_class.shard_class();
        let conn = self.acquire_connection(class)?;
        let outcome = upsert_catalog_entry(&conn, symbol, asset_class, entry)?;
        drop(conn);

        if let Some(handle) = self.handles.write().get_mut(&class) {
            handle.last_accessed = now_millis();
            handle.known_data_sources.extend(entry.data_sources.iter().cloned());
        }
        Ok(outcome)
    }

    /// 健康检查，不返回错误；不可达的分片报告为 Unhealthy 并附带原因
    #[instrument(target = "ShardManager", skip(self))]
    pub fn health_check(&self, asset_class: AssetClass) -> ShardHealth {
        let class = asset_class.shard_class();
        let path = self.shard_path(class);
        let started = Instant::now();

        let check = || -> Result<i64> {
            let conn = self.existing_connection(class)?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            count_objects(&conn, "table")
        };

        let result = check();
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let (status, table_count, error) = match result {
            Ok(tables) if tables >= BASE_TABLES.len() as i64 => (HealthStatus::Healthy, tables, None),
            Ok(tables) => (
                HealthStatus::Degraded,
                tables,
                Some(format!("表数量不足: {} < {}", tables, BASE_TABLES.len())),
            ),
            Err(e) => {
                warn!(
                    target: "ShardManager",
                    asset_class = %class,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "分片健康检查失败"
                );
                (HealthStatus::Unhealthy, 0, Some(e.to_string()))
            }
        };

        let size_bytes = file_size(&path);
        if let Some(handle) = self.handles.write().get_mut(&class) {
            handle.health_status = status;
            handle.size_bytes = size_bytes;
            if table_count > 0 {
                handle.table_count = table_count;
            }
        }

        ShardHealth {
            asset_class: class,
            status,
            exists: path.exists(),
            file_path: path,
            size_bytes,
            table_count,
            latency_ms,
            error,
            checked_at: now_millis(),
        }
    }

    /// 磁盘上已存在或当前已打开的分片，按类别顺序排列
    pub fn known_shards(&self) -> Vec<AssetClass> {
        let pools = self.pools.read();
        AssetClass::shard_classes()
            .into_iter()
            .filter(|c| pools.contains_key(c) || self.shard_path(*c).exists())
            .collect()
    }

    pub fn is_open(&self, asset_class: AssetClass) -> bool {
        self.pools.read().contains_key(&asset_class.shard_class())
    }

    pub fn shard_handle(&self, asset_class: AssetClass) -> Option<ShardHandle> {
        self.handles.read().get(&asset_class.shard_class()).cloned()
    }

    /// 所有已知分片的统计信息，单个分片失败只记录在该分片条目中
    #[instrument(target = "ShardManager", skip(self), err)]
    pub fn get_statistics(&self) -> Result<ShardStatistics> {
        let mut stats = ShardStatistics::default();

        for class in self.known_shards() {
            let path = self.shard_path(class);
            let mut entry = ShardStats {
                file_path: path.clone(),
                size_bytes: file_size(&path),
                ..ShardStats::default()
            };

            match self.count_records(class) {
                Ok((tables, per_table)) => {
                    entry.table_count = tables;
                    entry.record_count = per_table.values().sum();
                    entry.per_table = per_table;
                }
                Err(e) => {
                    warn!(target: "ShardManager", asset_class = %class, error.details = %e, "统计分片失败");
                    entry.error = Some(e.to_string());
                }
            }

            if let Some(handle) = self.handles.write().get_mut(&class) {
                handle.record_count = entry.record_count;
                handle.size_bytes = entry.size_bytes;
            }

            stats.total_size_bytes += entry.size_bytes;
            stats.total_records += entry.record_count;
            stats.per_class.insert(class, entry);
        }
        stats.shard_count = stats.per_class.len();
        Ok(stats)
    }

    pub(crate) fn count_records(&self, class: AssetClass) -> Result<(i64, BTreeMap<String, i64>)> {
        let conn = self.existing_connection(class)?;
        let tables = count_objects(&conn, "table")?;
        let mut per_table = BTreeMap::new();
        for table in BASE_TABLES {
            let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name), [], |r| r.get(0))?;
            per_table.insert(table.name.to_string(), count);
        }
        Ok((tables, per_table))
    }

    /// 关闭分片的连接池；已借出的连接在归还后释放
    pub fn close_pool(&self, asset_class: AssetClass) -> bool {
        let class = asset_class.shard_class();
        let removed = self.pools.write().remove(&class).is_some();
        if removed {
            debug!(target: "ShardManager", decision = "pool_closed", asset_class = %class, "连接池已关闭");
        }
        removed
    }

    pub fn close_all(&self) {
        let closed: Vec<AssetClass> = self.pools.write().drain().map(|(c, _)| c).collect();
        info!(target: "ShardManager", closed = closed.len(), "已关闭所有连接池");
    }

    /// 在分片离线期间执行 `f`：持有初始化锁，摘下连接池并等待借出的连接全部归还
    ///
    /// 等待超过连接超时时间会放回连接池并返回 Timeout。`f` 返回后连接池保持关闭，
    /// 下次访问时重新建立。
    pub(crate) fn with_shard_offline<T>(
        &self,
        asset_class: AssetClass,
        f: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let class = asset_class.shard_class();
        let _init = self.init_lock.lock();

        if let Some(pool) = self.pools.write().remove(&class) {
            let wait = Duration::from_secs(self.config.read().connection_timeout_secs);
            let started = Instant::now();
            loop {
                let state = pool.state();
                if state.idle_connections >= state.connections {
                    break;
                }
                if started.elapsed() >= wait {
                    let busy = state.connections - state.idle_connections;
                    self.pools.write().insert(class, pool);
                    warn!(target: "ShardManager", asset_class = %class, busy, "等待连接归还超时，分片保持在线");
                    return Err(AppError::Timeout(format!(
                        "分片 {} 仍有 {} 个连接未归还",
                        class, busy
                    )));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            drop(pool);
            debug!(target: "ShardManager", decision = "pool_drained", asset_class = %class, "连接池已排空");
        }

        f(&self.shard_path(class))
    }

    /// 删除分片文件；返回文件此前是否存在
    #[instrument(target = "ShardManager", skip(self), err)]
    pub fn delete_shard(&self, asset_class: AssetClass) -> Result<bool> {
        let class = asset_class.shard_class();
        let _init = self.init_lock.lock();
        self.close_pool(class);
        self.handles.write().remove(&class);

        let path = self.shard_path(class);
        let existed = path.exists();
        remove_shard_files(&path)?;
        info!(target: "ShardManager", asset_class = %class, existed, "分片已删除");
        Ok(existed)
    }
}
