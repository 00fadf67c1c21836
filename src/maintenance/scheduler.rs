//! 维护任务调度器
//!
//! 提交立即返回任务 ID，执行在有界的阻塞线程池中进行，完成情况通过轮询任务状态观察。
//! 只有处于 pending 的任务可以取消；运行中的任务不会被抢占。

use crate::common::{now_millis, AppError, AssetClass, MaintenanceConfig, Result};
use crate::maintenance::health::{
    backup_shard, cleanup_shard, integrity_check, shard_health_report, summarize, update_statistics, vacuum_shard,
};
use crate::maintenance::task::{
    HealthSummary, MaintenanceTask, ShardOutcome, TaskParams, TaskPriority, TaskResult, TaskStatus, TaskTarget,
    TaskType,
};
use crate::shard::ShardManager;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 队列条目：优先级高者先出，同优先级按提交顺序
type QueueEntry = (TaskPriority, Reverse<u64>, String);

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_duration_ms: i64,
    by_type: BTreeMap<TaskType, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatistics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending: usize,
    pub running: usize,
    pub history_len: usize,
    pub avg_duration_ms: f64,
    pub by_type: BTreeMap<TaskType, u64>,
}

struct SchedulerInner {
    manager: Arc<ShardManager>,
    history_limit: usize,
    semaphore: Arc<Semaphore>,
    /// 未结束（pending/running）的任务
    tasks: RwLock<HashMap<String, MaintenanceTask>>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    history: Mutex<VecDeque<MaintenanceTask>>,
    counters: Mutex<Counters>,
    seq: AtomicU64,
}

impl SchedulerInner {
    fn is_pending(&self, id: &str) -> bool {
        self.tasks
            .read()
            .get(id)
            .map(|t| t.status == TaskStatus::Pending)
            .unwrap_or(false)
    }

    /// pending -> running
    fn begin(&self, id: &str) -> Result<(TaskType, TaskTarget, TaskParams)> {
        {
            let mut tasks = self.tasks.write();
            if let Some(task) = tasks.get_mut(id) {
                if !task.status.can_transition_to(TaskStatus::Running) {
                    return Err(AppError::InvalidTaskState {
                        task_id: id.to_string(),
                        reason: format!("状态为 {}，无法开始执行", task.status),
                    });
                }
                task.status = TaskStatus::Running;
                task.started_at = Some(now_millis());
                return Ok((task.task_type, task.target, task.params.clone()));
            }
        }
        if self.history.lock().iter().any(|t| t.id == id) {
            return Err(AppError::InvalidTaskState {
                task_id: id.to_string(),
                reason: "任务已结束".to_string(),
            });
        }
        Err(AppError::TaskNotFound(id.to_string()))
    }

    fn set_progress(&self, id: &str, done: usize, total: usize) {
        if let Some(task) = self.tasks.write().get_mut(id) {
            task.progress = (done as f64 / total.max(1) as f64 * 100.0).min(100.0);
        }
    }

    fn push_history(&self, task: MaintenanceTask) {
        let mut history = self.history.lock();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(task);
    }

    /// running -> completed / failed，并移入历史
    fn finish(&self, id: &str, outcome: std::result::Result<TaskResult, String>) -> Option<MaintenanceTask> {
        let mut task = self.tasks.write().remove(id)?;
        task.completed_at = Some(now_millis());
        match outcome {
            Ok(result) => {
                task.status = TaskStatus::Completed;
                task.progress = 100.0;
                task.result = Some(result);
            }
            Err(error) => {
                task.status = TaskStatus::Failed;
                task.error = Some(error);
            }
        }

        {
            let mut counters = self.counters.lock();
            match task.status {
                TaskStatus::Completed => counters.completed += 1,
                _ => counters.failed += 1,
            }
            counters.total_duration_ms += task.duration_ms().unwrap_or(0);
        }
        self.push_history(task.clone());
        Some(task)
    }

    fn target_shards(&self, target: TaskTarget) -> Vec<AssetClass> {
        match target {
            TaskTarget::All => self.manager.known_shards(),
            TaskTarget::Shard(class) => vec![class.shard_class()],
        }
    }

    fn shard_operation(&self, task_type: TaskType, class: AssetClass, params: &TaskParams) -> Result<ShardOutcome> {
        let manager = self.manager.as_ref();
        match task_type {
            TaskType::HealthCheck => Ok(ShardOutcome::Health(shard_health_report(manager, class, params.full_check))),
            TaskType::Vacuum => vacuum_shard(manager, class, params.analyze).map(ShardOutcome::Vacuum),
            TaskType::Backup => backup_shard(manager, class).map(ShardOutcome::Backup),
            TaskType::IntegrityCheck => integrity_check(manager, class).map(ShardOutcome::Integrity),
            TaskType::DataCleanup => cleanup_shard(manager, class, params.retention_days).map(ShardOutcome::Cleanup),
            TaskType::StatisticsUpdate => update_statistics(manager, class).map(ShardOutcome::Statistics),
        }
    }

    /// 在阻塞线程中执行任务；单个分片失败只记录在结果里，全部失败时任务失败
    fn perform(&self, id: &str, task_type: TaskType, target: TaskTarget, params: &TaskParams) -> Result<TaskResult> {
        let classes = self.target_shards(target);
        let total = classes.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut first_error = None;

        for (idx, class) in classes.into_iter().enumerate() {
            match self.shard_operation(task_type, class, params) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(
                        target: "MaintenanceScheduler",
                        task_id = id,
                        asset_class = %class,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "分片维护失败"
                    );
                    outcomes.push(ShardOutcome::Error { asset_class: class, error: e.to_string() });
                    first_error.get_or_insert(e);
                }
            }
            self.set_progress(id, idx + 1, total);
        }

        if let Some(e) = first_error {
            if outcomes.iter().all(ShardOutcome::is_error) {
                return Err(e);
            }
        }

        if task_type == TaskType::HealthCheck {
            let reports = outcomes
                .into_iter()
                .filter_map(|o| match o {
                    ShardOutcome::Health(report) => Some(report),
                    _ => None,
                })
                .collect();
            return Ok(TaskResult::HealthCheck(summarize(reports)));
        }
        Ok(TaskResult::PerShard(outcomes))
    }
}

#[derive(Clone)]
pub struct MaintenanceScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("active", &self.inner.tasks.read().len())
            .field("history", &self.inner.history.lock().len())
            .finish()
    }
}

impl MaintenanceScheduler {
    pub fn new(manager: Arc<ShardManager>, config: &MaintenanceConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                manager,
                history_limit: config.history_limit.max(1),
                semaphore: Arc::new(Semaphore::new(config.max_workers.max(1))),
                tasks: RwLock::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                history: Mutex::new(VecDeque::new()),
                counters: Mutex::new(Counters::default()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// 提交任务，返回任务 ID；任务进入 pending 队列
    #[instrument(target = "MaintenanceScheduler", skip(self, target, params))]
    pub fn submit(&self, task_type: TaskType, target: TaskTarget, priority: TaskPriority, params: TaskParams) -> String {
        let id = Uuid::new_v4().to_string();
        let task = MaintenanceTask::new(id.clone(), task_type, target, priority, params);
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);

        self.inner.tasks.write().insert(id.clone(), task);
        self.inner.queue.lock().push((priority, Reverse(seq), id.clone()));
        {
            let mut counters = self.inner.counters.lock();
            counters.submitted += 1;
            *counters.by_type.entry(task_type).or_default() += 1;
        }

        info!(target: "MaintenanceScheduler", task_id = %id, task_type = %task_type, scope = %target, "维护任务已提交");
        id
    }

    async fn run(inner: Arc<SchedulerInner>, id: String, permit: OwnedSemaphorePermit) -> Result<MaintenanceTask> {
        let (task_type, target, params) = inner.begin(&id)?;
        info!(target: "MaintenanceScheduler", task_id = %id, task_type = %task_type, "维护任务开始执行");

        let worker = Arc::clone(&inner);
        let worker_id = id.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            worker.perform(&worker_id, task_type, target, &params)
        })
        .await;

        let outcome = match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                warn!(
                    target: "MaintenanceScheduler",
                    task_id = %id,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "维护任务失败"
                );
                Err(e.to_string())
            }
            Err(join) => {
                warn!(target: "MaintenanceScheduler", task_id = %id, error.details = %join, "维护任务线程异常退出");
                Err(format!("任务线程异常退出: {}", join))
            }
        };

        let task = inner.finish(&id, outcome).ok_or_else(|| AppError::TaskNotFound(id.clone()))?;
        info!(
            target: "MaintenanceScheduler",
            task_id = %id,
            status = %task.status,
            duration_ms = task.duration_ms().unwrap_or(0),
            "维护任务结束"
        );
        Ok(task)
    }

    /// 执行指定的 pending 任务直到结束，返回最终状态
    pub async fn execute(&self, task_id: &str) -> Result<MaintenanceTask> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| AppError::TaskJoinError(e.to_string()))?;
        Self::run(Arc::clone(&self.inner), task_id.to_string(), permit).await
    }

    /// 后台执行单个任务
    pub fn spawn(&self, task_id: &str) -> JoinHandle<Result<MaintenanceTask>> {
        let this = self.clone();
        let id = task_id.to_string();
        tokio::spawn(async move { this.execute(&id).await })
    }

    /// 按优先级派发所有 pending 任务，受工作线程数限制，全部结束后返回
    pub async fn run_pending(&self) -> Vec<MaintenanceTask> {
        let mut handles = Vec::new();
        loop {
            let next = self.inner.queue.lock().pop();
            let Some((_, _, id)) = next else {
                break;
            };
            // 已取消或已被直接执行的任务
            if !self.inner.is_pending(&id) {
                continue;
            }
            let permit = match Arc::clone(&self.inner.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            debug!(target: "MaintenanceScheduler", task_id = %id, "派发维护任务");
            handles.push(tokio::spawn(Self::run(Arc::clone(&self.inner), id, permit)));
        }

        let mut finished = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Ok(task)) => finished.push(task),
                Ok(Err(e)) => debug!(target: "MaintenanceScheduler", { error.details = %e }, "任务未执行"),
                Err(join) => warn!(target: "MaintenanceScheduler", { error.details = %join }, "派发任务异常退出"),
            }
        }
        finished
    }

    pub fn spawn_pending(&self) -> JoinHandle<Vec<MaintenanceTask>> {
        let this = self.clone();
        tokio::spawn(async move { this.run_pending().await })
    }

    /// 取消 pending 任务；运行中或已结束的任务返回 InvalidTaskState
    pub fn cancel(&self, task_id: &str) -> Result<MaintenanceTask> {
        let mut task = {
            let mut tasks = self.inner.tasks.write();
            let status = match tasks.get(task_id) {
                Some(task) => task.status,
                None => {
                    drop(tasks);
                    if self.inner.history.lock().iter().any(|t| t.id == task_id) {
                        return Err(AppError::InvalidTaskState {
                            task_id: task_id.to_string(),
                            reason: "任务已结束".to_string(),
                        });
                    }
                    return Err(AppError::TaskNotFound(task_id.to_string()));
                }
            };
            if !status.can_transition_to(TaskStatus::Cancelled) {
                return Err(AppError::InvalidTaskState {
                    task_id: task_id.to_string(),
                    reason: format!("状态为 {}，只能取消 pending 任务", status),
                });
            }
            tasks
                .remove(task_id)
                .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?
        };
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now_millis());

        self.inner.counters.lock().cancelled += 1;
        self.inner.push_history(task.clone());
        info!(target: "MaintenanceScheduler", task_id = %task_id, "维护任务已取消");
        Ok(task)
    }

    /// 查询任务当前状态，包括已进入历史的任务
    pub fn get_task_status(&self, task_id: &str) -> Option<MaintenanceTask> {
        if let Some(task) = self.inner.tasks.read().get(task_id) {
            return Some(task.clone());
        }
        self.inner.history.lock().iter().rev().find(|t| t.id == task_id).cloned()
    }

    /// 未结束的任务，按提交时间排序
    pub fn list_tasks(&self) -> Vec<MaintenanceTask> {
        let mut tasks: Vec<MaintenanceTask> = self.inner.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// 已结束的任务，最旧的在前
    pub fn history(&self) -> Vec<MaintenanceTask> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let (pending, running) = {
            let tasks = self.inner.tasks.read();
            let pending = tasks.values().filter(|t| t.status == TaskStatus::Pending).count();
            (pending, tasks.len() - pending)
        };
        let history_len = self.inner.history.lock().len();
        let counters = self.inner.counters.lock();
        let finished = counters.completed + counters.failed;
        SchedulerStatistics {
            submitted: counters.submitted,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            pending,
            running,
            history_len,
            avg_duration_ms: if finished > 0 {
                counters.total_duration_ms as f64 / finished as f64
            } else {
                0.0
            },
            by_type: counters.by_type.clone(),
        }
    }

    /// 轮询直到任务结束或超时
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<MaintenanceTask> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self
                .get_task_status(task_id)
                .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
            if task.status.is_finished() {
                return Ok(task);
            }
            if Instant::now() >= deadline {
                return Err(AppError::Timeout(format!("等待任务 {} 超过 {:?}", task_id, timeout)));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// 同步执行一次轻量健康检查（不做完整性校验）
    pub fn get_system_health_summary(&self) -> HealthSummary {
        let reports = self
            .inner
            .manager
            .known_shards()
            .into_iter()
            .map(|class| shard_health_report(&self.inner.manager, class, false))
            .collect();
        summarize(reports)
    }
}
