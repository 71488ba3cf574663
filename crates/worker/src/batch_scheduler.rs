//! 批次调度
//!
//! 同一批次只允许一个执行循环。循环按 batch_order 逐个执行任务，
//! 任务之间按定时时间或发布间隔等待，等待期间响应停止信号。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use publisher_config::BatchConfig;
use publisher_domain::{StopBatchResult, TaskRepository, TaskSummary};
use publisher_errors::PublishResult;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sandbox::{TaskOutcome, TaskRunner};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchRunSummary {
    pub batch_id: String,
    pub total_tasks: usize,
    pub attempts: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub cancelled: u32,
    pub skipped: u32,
    pub stopped: bool,
    /// 导致循环提前结束的错误
    pub error: Option<String>,
}

impl BatchRunSummary {
    fn new(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Elapsed,
    Stopped,
    /// 服务端已没有待执行任务
    Drained,
}

enum Pause {
    None,
    /// 重新执行同一任务前的等待
    Fixed(Duration),
    /// 进入下一个任务前的等待
    BeforeNext,
}

struct RunningBatch {
    stop: CancellationToken,
    completion: Shared<BoxFuture<'static, BatchRunSummary>>,
}

struct SchedulerInner {
    tasks: Arc<dyn TaskRepository>,
    runner: Arc<dyn TaskRunner>,
    config: BatchConfig,
    running: Mutex<HashMap<String, RunningBatch>>,
}

#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<SchedulerInner>,
}

impl BatchScheduler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        runner: Arc<dyn TaskRunner>,
        config: BatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks,
                runner,
                config,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 执行批次；批次已在执行时等待已有循环的结果
    pub async fn execute_batch(&self, batch_id: &str) -> BatchRunSummary {
        let completion = {
            let mut running = self.inner.running.lock().await;
            if let Some(existing) = running.get(batch_id) {
                info!("批次 {} 已在执行中，等待已有执行结果", batch_id);
                existing.completion.clone()
            } else {
                let stop = CancellationToken::new();
                let inner = Arc::clone(&self.inner);
                let id = batch_id.to_string();
                let token = stop.clone();
                let handle = tokio::spawn(async move {
                    let summary = inner.run_batch(&id, &token).await;
                    inner.running.lock().await.remove(&id);
                    summary
                });

                let id = batch_id.to_string();
                let completion = async move {
                    match handle.await {
                        Ok(summary) => summary,
                        Err(e) => {
                            error!("批次 {} 执行循环异常退出: {}", id, e);
                            BatchRunSummary {
                                error: Some(e.to_string()),
                                ..BatchRunSummary::new(&id)
                            }
                        }
                    }
                }
                .boxed()
                .shared();

                running.insert(
                    batch_id.to_string(),
                    RunningBatch {
                        stop,
                        completion: completion.clone(),
                    },
                );
                completion
            }
        };

        completion.await
    }

    /// 停止批次：先停本地循环（同时取消正在执行的任务），再通知服务端
    pub async fn stop_batch(&self, batch_id: &str) -> PublishResult<StopBatchResult> {
        if let Some(running) = self.inner.running.lock().await.get(batch_id) {
            info!("停止本地批次执行循环: {}", batch_id);
            running.stop.cancel();
        }
        let result = self.inner.tasks.stop_batch(batch_id).await?;
        info!(
            "批次 {} 已停止: 取消 {} 个待执行任务，终止 {} 个执行中任务",
            batch_id, result.cancelled_count, result.terminated_count
        );
        Ok(result)
    }

    pub async fn is_running(&self, batch_id: &str) -> bool {
        self.inner.running.lock().await.contains_key(batch_id)
    }

    pub async fn running_batches(&self) -> Vec<String> {
        self.inner.running.lock().await.keys().cloned().collect()
    }

    /// 停止所有本地循环，不修改服务端任务状态
    pub async fn shutdown(&self) {
        let running = self.inner.running.lock().await;
        for (batch_id, batch) in running.iter() {
            debug!("关闭批次执行循环: {}", batch_id);
            batch.stop.cancel();
        }
    }
}

impl SchedulerInner {
    async fn run_batch(&self, batch_id: &str, stop: &CancellationToken) -> BatchRunSummary {
        let mut summary = BatchRunSummary::new(batch_id);

        let mut tasks = match self.tasks.list_by_batch(batch_id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("获取批次 {} 的任务失败: {}", batch_id, e);
                summary.error = Some(e.to_string());
                return summary;
            }
        };
        tasks.sort_by_key(|t| t.batch_order);
        summary.total_tasks = tasks.len();
        info!("批次 {} 开始执行，共 {} 个任务", batch_id, tasks.len());

        let mut index = 0;
        while index < tasks.len() {
            if stop.is_cancelled() {
                break;
            }
            let task_id = tasks[index].id;

            match self.tasks.get_task(task_id).await {
                Ok(current) if current.status.is_terminal() => {
                    debug!("批次 {} 任务 {} 已是 {}，跳过", batch_id, task_id, current.status);
                    summary.skipped += 1;
                    index += 1;
                    if index >= tasks.len() {
                        continue;
                    }
                    // 重启后续跑时补足已完成任务剩余的发布间隔
                    let wait = self.remaining_interval(&current);
                    if wait.is_zero() {
                        continue;
                    }
                    info!(
                        "批次 {} 任务 {} 已完成，补足剩余间隔 {:?}",
                        batch_id, task_id, wait
                    );
                    match self.wait(batch_id, stop, wait).await {
                        WaitOutcome::Elapsed => continue,
                        WaitOutcome::Stopped => break,
                        WaitOutcome::Drained => {
                            info!("批次 {} 在服务端已无待执行任务，结束执行", batch_id);
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("批次 {} 任务 {} 查询失败，跳过: {}", batch_id, task_id, e);
                    summary.skipped += 1;
                    index += 1;
                    continue;
                }
            }

            summary.attempts += 1;
            let pause = match self.runner.run_task(task_id, stop.child_token()).await {
                Ok(TaskOutcome::Succeeded) => {
                    summary.succeeded += 1;
                    index += 1;
                    Pause::BeforeNext
                }
                Ok(TaskOutcome::RetryScheduled {
                    retry_count,
                    max_retries,
                }) => {
                    info!(
                        "批次 {} 任务 {} 将重试 ({}/{})",
                        batch_id, task_id, retry_count, max_retries
                    );
                    Pause::Fixed(Duration::from_secs(self.config.retry_interval_seconds))
                }
                Ok(TaskOutcome::Failed { message }) => {
                    warn!("批次 {} 任务 {} 失败: {}", batch_id, task_id, message);
                    summary.failed += 1;
                    index += 1;
                    Pause::BeforeNext
                }
                Ok(TaskOutcome::TimedOut { message }) => {
                    warn!("批次 {} 任务 {} 超时: {}", batch_id, task_id, message);
                    summary.timed_out += 1;
                    index += 1;
                    Pause::BeforeNext
                }
                Ok(TaskOutcome::Cancelled) => {
                    summary.cancelled += 1;
                    index += 1;
                    Pause::BeforeNext
                }
                Ok(TaskOutcome::Skipped(status)) => {
                    debug!("批次 {} 任务 {} 未执行，当前状态 {}", batch_id, task_id, status);
                    summary.skipped += 1;
                    index += 1;
                    Pause::None
                }
                Err(e) if e.is_rate_limited() => {
                    let wait = e
                        .retry_after()
                        .unwrap_or(Duration::from_secs(self.config.rate_limit_wait_seconds));
                    warn!("批次 {} 任务 {} 触发限流，{:?} 后重新执行: {}", batch_id, task_id, wait, e);
                    Pause::Fixed(wait)
                }
                Err(e) if e.is_rate_limit_exhausted() => {
                    error!("批次 {} 持续触发限流，停止执行: {}", batch_id, e);
                    summary.error = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    error!("批次 {} 任务 {} 执行出错: {}", batch_id, task_id, e);
                    summary.failed += 1;
                    index += 1;
                    Pause::BeforeNext
                }
            };

            let wait = match pause {
                Pause::None => Duration::ZERO,
                Pause::Fixed(wait) => wait,
                Pause::BeforeNext if index < tasks.len() => {
                    self.wait_before_next(&tasks[index - 1], &tasks[index])
                }
                Pause::BeforeNext => Duration::ZERO,
            };
            if wait.is_zero() {
                continue;
            }

            debug!("批次 {} 等待 {:?}", batch_id, wait);
            match self.wait(batch_id, stop, wait).await {
                WaitOutcome::Elapsed => {}
                WaitOutcome::Stopped => break,
                WaitOutcome::Drained => {
                    info!("批次 {} 在服务端已无待执行任务，结束执行", batch_id);
                    break;
                }
            }
        }

        summary.stopped = stop.is_cancelled();
        info!(
            "批次 {} 执行结束: 成功 {}，失败 {}，超时 {}，取消 {}，跳过 {}{}",
            batch_id,
            summary.succeeded,
            summary.failed,
            summary.timed_out,
            summary.cancelled,
            summary.skipped,
            if summary.stopped { "（已停止）" } else { "" }
        );
        summary
    }

    /// 下一个任务有未来的定时时间时等到该时间，否则按当前任务的发布间隔加缓冲
    fn wait_before_next(&self, current: &TaskSummary, next: &TaskSummary) -> Duration {
        if let Some(scheduled_at) = next.scheduled_at {
            if let Ok(wait) = (scheduled_at - Utc::now()).to_std() {
                return wait;
            }
        }
        if current.interval_minutes > 0 {
            return Duration::from_secs(current.interval_minutes as u64 * 60)
                + Duration::from_secs(self.config.interval_buffer_seconds);
        }
        Duration::ZERO
    }

    /// 已完成任务距离 completed_at + 间隔 + 缓冲 还剩的时间
    fn remaining_interval(&self, finished: &TaskSummary) -> Duration {
        let Some(completed_at) = finished.completed_at else {
            return Duration::ZERO;
        };
        if finished.interval_minutes <= 0 {
            return Duration::ZERO;
        }
        let ready_at = completed_at
            + chrono::Duration::minutes(finished.interval_minutes as i64)
            + chrono::Duration::seconds(self.config.interval_buffer_seconds as i64);
        (ready_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    async fn wait(&self, batch_id: &str, stop: &CancellationToken, duration: Duration) -> WaitOutcome {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let recheck = Duration::from_secs(self.config.server_recheck_seconds.max(1));
        let deadline = Instant::now() + duration;
        let mut next_recheck = Instant::now() + recheck;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Elapsed;
            }

            tokio::select! {
                _ = stop.cancelled() => return WaitOutcome::Stopped,
                _ = tokio::time::sleep(poll.min(deadline - now)) => {}
            }

            if Instant::now() >= next_recheck {
                next_recheck = Instant::now() + recheck;
                match self.tasks.batch_info(batch_id).await {
                    Ok(info) if info.pending_tasks == 0 => return WaitOutcome::Drained,
                    Ok(_) => {}
                    Err(e) => debug!("批次 {} 复查服务端状态失败: {}", batch_id, e),
                }
            }
        }
    }
}
