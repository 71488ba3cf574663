//! 限流退避控制
//!
//! 只吸收服务端 429 类错误（间隔控制、并发控制、通用限流），其他错误原样返回。
//! 这里的重试对任务状态机不可见，不会消耗任务自身的重试次数。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use publisher_config::BackoffSettings;
use publisher_domain::{
    BatchInfo, ConfirmReceipt, LogLevel, NewTask, PublishingTask, QuotaInfo, QuotaLedger,
    ReleaseReceipt, Reservation, ReservationStatus, ReserveReceipt, ReserveRequest,
    StopBatchResult, TaskFilter, TaskLog, TaskRepository, TaskStatus, TaskSummary,
};
use publisher_errors::{PublishError, PublishResult};
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffSettings::default())
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(settings: &BackoffSettings) -> Self {
        Self {
            base_delay: Duration::from_secs(settings.base_delay_seconds),
            max_delay: Duration::from_secs(settings.max_delay_seconds),
            jitter_factor: settings.jitter_factor,
            max_attempts: settings.max_attempts.max(1),
        }
    }
}

impl BackoffPolicy {
    /// 第 `attempt` 次（从 1 开始）限流后的基础等待，不含抖动
    pub fn base_wait(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(retry_after) = retry_after {
            return retry_after;
        }
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// 加上随机抖动后的实际等待。服务端给出 retryAfter 时只向后抖动
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let wait = self.base_wait(attempt, retry_after);
        let spread = wait.as_secs_f64() * self.jitter_factor;
        let offset = spread * (rand::random::<f64>() - 0.5) * 2.0;
        let offset = if retry_after.is_some() { offset.abs() } else { offset };
        Duration::from_secs_f64((wait.as_secs_f64() + offset).max(0.0))
    }

    /// 执行 `operation`，遇到限流按策略等待后重试
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> PublishResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PublishResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_rate_limited() => {
                    if attempt >= self.max_attempts {
                        error!("{} 连续 {} 次触发限流，放弃: {}", operation, attempt, err);
                        return Err(PublishError::RateLimitExhausted {
                            attempts: attempt,
                            message: operation.to_string(),
                        });
                    }
                    let delay = self.delay_for(attempt, err.retry_after());
                    warn!(
                        "{} 触发{} (第 {}/{} 次)，{:?} 后重试",
                        operation,
                        publisher_errors::rate_limit_label(err.error_code()),
                        attempt,
                        self.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// 为远程任务仓储的写操作加上限流退避
pub struct BackoffTaskRepository {
    inner: Arc<dyn TaskRepository>,
    policy: BackoffPolicy,
}

impl BackoffTaskRepository {
    pub fn new(inner: Arc<dyn TaskRepository>, policy: BackoffPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl TaskRepository for BackoffTaskRepository {
    async fn create_task(&self, task: &NewTask) -> PublishResult<TaskSummary> {
        let inner = &self.inner;
        self.policy
            .run("创建任务", move || inner.create_task(task))
            .await
    }

    async fn get_task(&self, id: i64) -> PublishResult<TaskSummary> {
        self.inner.get_task(id).await
    }

    async fn get_task_for_execution(&self, id: i64) -> PublishResult<PublishingTask> {
        self.inner.get_task_for_execution(id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> PublishResult<Vec<TaskSummary>> {
        self.inner.list_tasks(filter).await
    }

    async fn list_by_batch(&self, batch_id: &str) -> PublishResult<Vec<TaskSummary>> {
        self.inner.list_by_batch(batch_id).await
    }

    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> PublishResult<()> {
        let inner = &self.inner;
        self.policy
            .run("更新任务状态", move || {
                inner.update_status(id, status, error_message)
            })
            .await
    }

    async fn increment_retry_count(&self, id: i64) -> PublishResult<i32> {
        let inner = &self.inner;
        self.policy
            .run("增加重试次数", move || inner.increment_retry_count(id))
            .await
    }

    async fn cancel_task(&self, id: i64) -> PublishResult<()> {
        let inner = &self.inner;
        self.policy
            .run("取消任务", move || inner.cancel_task(id))
            .await
    }

    async fn delete_task(&self, id: i64) -> PublishResult<()> {
        let inner = &self.inner;
        self.policy
            .run("删除任务", move || inner.delete_task(id))
            .await
    }

    async fn delete_batch(&self, batch_id: &str) -> PublishResult<u64> {
        let inner = &self.inner;
        self.policy
            .run("删除批次", move || inner.delete_batch(batch_id))
            .await
    }

    async fn batch_info(&self, batch_id: &str) -> PublishResult<BatchInfo> {
        self.inner.batch_info(batch_id).await
    }

    async fn stop_batch(&self, batch_id: &str) -> PublishResult<StopBatchResult> {
        let inner = &self.inner;
        self.policy
            .run("停止批次", move || inner.stop_batch(batch_id))
            .await
    }

    async fn add_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> PublishResult<()> {
        let inner = &self.inner;
        self.policy
            .run("记录任务日志", move || {
                inner.add_log(task_id, level, message, details.clone())
            })
            .await
    }

    async fn get_logs(&self, task_id: i64) -> PublishResult<Vec<TaskLog>> {
        self.inner.get_logs(task_id).await
    }
}

/// 为远程配额账本的写操作加上限流退避
pub struct BackoffQuotaLedger {
    inner: Arc<dyn QuotaLedger>,
    policy: BackoffPolicy,
}

impl BackoffQuotaLedger {
    pub fn new(inner: Arc<dyn QuotaLedger>, policy: BackoffPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl QuotaLedger for BackoffQuotaLedger {
    async fn reserve(&self, request: &ReserveRequest) -> PublishResult<ReserveReceipt> {
        let inner = &self.inner;
        self.policy
            .run("预扣减配额", move || inner.reserve(request))
            .await
    }

    async fn confirm(
        &self,
        reservation_id: &str,
        result: Option<serde_json::Value>,
    ) -> PublishResult<ConfirmReceipt> {
        let inner = &self.inner;
        self.policy
            .run("确认配额消费", move || {
                inner.confirm(reservation_id, result.clone())
            })
            .await
    }

    async fn release(
        &self,
        reservation_id: &str,
        reason: Option<&str>,
        error_code: Option<&str>,
    ) -> PublishResult<ReleaseReceipt> {
        let inner = &self.inner;
        self.policy
            .run("释放预留配额", move || {
                inner.release(reservation_id, reason, error_code)
            })
            .await
    }

    async fn quota_info(&self, user_id: i64) -> PublishResult<QuotaInfo> {
        self.inner.quota_info(user_id).await
    }

    async fn user_reservations(
        &self,
        user_id: i64,
        status: Option<ReservationStatus>,
    ) -> PublishResult<Vec<Reservation>> {
        self.inner.user_reservations(user_id, status).await
    }

    async fn set_quota_limit(
        &self,
        user_id: i64,
        quota_type: &str,
        limit: i64,
    ) -> PublishResult<()> {
        let inner = &self.inner;
        self.policy
            .run("设置配额上限", move || {
                inner.set_quota_limit(user_id, quota_type, limit)
            })
            .await
    }
}
