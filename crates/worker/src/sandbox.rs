//! 单任务执行控制器
//!
//! 负责一次发布尝试的完整生命周期：状态迁移、配额预留与确认、自动化会话、
//! 执行截止时间以及失败后的重试记账。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use publisher_config::ExecutionConfig;
use publisher_domain::{LogLevel, PublishingTask, QuotaLedger, ReserveRequest, TaskRepository, TaskStatus};
use publisher_errors::{PublishError, PublishResult};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::automation::{AutomationLauncher, AutomationSession};

const PUBLISH_QUOTA: &str = "publish";
const MAX_RECOMMENDED_TIMEOUT_MINUTES: u64 = 60;

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded,
    /// 已回到 pending，等待调度器重新执行
    RetryScheduled { retry_count: i32, max_retries: i32 },
    Failed { message: String },
    TimedOut { message: String },
    Cancelled,
    /// 任务已处于终态或已被他人接手，未执行
    Skipped(TaskStatus),
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// 执行单个任务。限流错误以 `Err` 返回，其余失败都体现在 `TaskOutcome` 中
    async fn run_task(&self, task_id: i64, cancel: CancellationToken) -> PublishResult<TaskOutcome>;
}

pub struct ExecutionSandbox {
    tasks: Arc<dyn TaskRepository>,
    ledger: Arc<dyn QuotaLedger>,
    launcher: Arc<dyn AutomationLauncher>,
    config: ExecutionConfig,
    client_id: Option<String>,
}

impl ExecutionSandbox {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        ledger: Arc<dyn QuotaLedger>,
        launcher: Arc<dyn AutomationLauncher>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            tasks,
            ledger,
            launcher,
            config,
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// 任务自身的超时优先，其次是全局配置，最少 1 分钟
    pub fn deadline_for(&self, task: &PublishingTask) -> Duration {
        let minutes = task
            .timeout_minutes
            .map(|m| m.max(0) as u64)
            .unwrap_or(self.config.task_timeout_minutes)
            .max(1);
        if minutes > MAX_RECOMMENDED_TIMEOUT_MINUTES {
            warn!(
                "任务 {} 的超时时间 {} 分钟超过建议值 {} 分钟",
                task.id, minutes, MAX_RECOMMENDED_TIMEOUT_MINUTES
            );
        }
        Duration::from_secs(minutes * 60)
    }

    async fn log(&self, task_id: i64, level: LogLevel, message: &str, details: Option<serde_json::Value>) {
        if let Err(e) = self.tasks.add_log(task_id, level, message, details).await {
            debug!("任务 {} 写入执行日志失败: {}", task_id, e);
        }
    }

    async fn back_to_pending(&self, task_id: i64, reason: &str) {
        if let Err(e) = self
            .tasks
            .update_status(task_id, TaskStatus::Pending, Some(reason))
            .await
        {
            warn!("任务 {} 恢复为待执行失败: {}", task_id, e);
        }
    }

    async fn release(&self, task_id: i64, reservation_id: &str, reason: &str, error_code: &str) {
        if let Err(e) = self
            .ledger
            .release(reservation_id, Some(reason), Some(error_code))
            .await
        {
            warn!("任务 {} 释放配额预留 {} 失败: {}", task_id, reservation_id, e);
        }
    }

    /// 登录并发布，步骤之间检查取消
    async fn attempt(
        &self,
        session: &dyn AutomationSession,
        cancel: &CancellationToken,
    ) -> PublishResult<serde_json::Value> {
        session.login().await?;
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled("登录后任务被取消".to_string()));
        }
        session.publish(cancel).await
    }

    /// 在截止时间内启动并运行自动化会话；截止时间同时覆盖启动过程，
    /// 超时时先强制关闭会话再返回
    async fn drive(
        &self,
        task: &PublishingTask,
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> PublishResult<serde_json::Value> {
        let deadline_at = Instant::now() + deadline;

        let session = tokio::select! {
            launched = self.launcher.launch(task) => launched?,
            _ = cancel.cancelled() => {
                return Err(PublishError::Cancelled("启动自动化会话时任务被取消".to_string()));
            }
            _ = tokio::time::sleep_until(deadline_at) => {
                warn!("任务 {} 启动自动化会话超过执行截止时间 {:?}", task.id, deadline);
                return Err(PublishError::DeadlineExceeded { task_id: task.id, deadline });
            }
        };

        let result = tokio::select! {
            result = self.attempt(session.as_ref(), cancel) => result,
            _ = cancel.cancelled() => {
                session.force_close().await;
                Err(PublishError::Cancelled("执行过程中任务被取消".to_string()))
            }
            _ = tokio::time::sleep_until(deadline_at) => {
                warn!("任务 {} 超过执行截止时间 {:?}，强制关闭自动化会话", task.id, deadline);
                session.force_close().await;
                Err(PublishError::DeadlineExceeded { task_id: task.id, deadline })
            }
        };

        if session.is_alive() {
            let close_timeout = Duration::from_secs(self.config.close_timeout_seconds);
            match tokio::time::timeout(close_timeout, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("任务 {} 关闭自动化会话失败，强制关闭: {}", task.id, e);
                    session.force_close().await;
                }
                Err(_) => {
                    warn!("任务 {} 关闭自动化会话超时，强制关闭", task.id);
                    session.force_close().await;
                }
            }
        }

        result
    }

    async fn on_success(
        &self,
        task: &PublishingTask,
        reservation_id: &str,
        published: serde_json::Value,
    ) -> PublishResult<TaskOutcome> {
        let result = json!({
            "status": "success",
            "taskId": task.id,
            "platform": task.platform_id,
            "publishedAt": chrono::Utc::now().to_rfc3339(),
            "result": published,
        });
        if let Err(e) = self.ledger.confirm(reservation_id, Some(result)).await {
            // 发布已生效，确认失败交给过期回收处理
            error!("任务 {} 确认配额消费失败: {}", task.id, e);
            if e.is_rate_limit_exhausted() {
                return Err(e);
            }
        }

        self.tasks
            .update_status(task.id, TaskStatus::Success, None)
            .await?;
        self.log(task.id, LogLevel::Info, "发布成功", Some(published)).await;
        info!("{} 发布成功", task.entity_description());
        Ok(TaskOutcome::Succeeded)
    }

    async fn on_failure(
        &self,
        task: &PublishingTask,
        reservation_id: &str,
        err: PublishError,
    ) -> PublishResult<TaskOutcome> {
        if err.is_cancelled() {
            self.release(task.id, reservation_id, "任务被取消", "CANCELLED").await;
            self.tasks
                .update_status(task.id, TaskStatus::Cancelled, Some("任务已被取消"))
                .await?;
            self.log(task.id, LogLevel::Warning, "任务执行被取消", None).await;
            info!("{} 已取消", task.entity_description());
            return Ok(TaskOutcome::Cancelled);
        }

        if err.is_rate_limited() || err.is_rate_limit_exhausted() {
            self.release(task.id, reservation_id, "触发限流", err.error_code()).await;
            self.back_to_pending(task.id, &err.to_string()).await;
            return Err(err);
        }

        let timed_out = matches!(err, PublishError::DeadlineExceeded { .. });
        let error_code = if timed_out { "TIMEOUT" } else { "EXECUTION_FAILED" };
        self.release(task.id, reservation_id, &err.to_string(), error_code).await;

        if err.is_fatal() {
            let message = err.to_string();
            self.tasks
                .update_status(task.id, TaskStatus::Failed, Some(&message))
                .await?;
            self.log(task.id, LogLevel::Error, &message, None).await;
            return Ok(TaskOutcome::Failed { message });
        }

        self.record_retry(task, err, timed_out).await
    }

    /// 失败计入重试次数，未用完则回到 pending
    async fn record_retry(
        &self,
        task: &PublishingTask,
        err: PublishError,
        timed_out: bool,
    ) -> PublishResult<TaskOutcome> {
        let retry_count = self.tasks.increment_retry_count(task.id).await?;
        let current = self.tasks.get_task_for_execution(task.id).await?;
        if current.is_terminal() {
            // 执行期间被停止或取消
            return Ok(TaskOutcome::Skipped(current.status));
        }

        let max_retries = current.max_retries;
        if retry_count < max_retries {
            let message = if timed_out {
                format!("执行超时，将自动重试 ({retry_count}/{max_retries})")
            } else {
                format!("执行失败，将自动重试 ({retry_count}/{max_retries})")
            };
            self.tasks
                .update_status(task.id, TaskStatus::Pending, Some(&message))
                .await?;
            self.log(
                task.id,
                LogLevel::Warning,
                &message,
                Some(json!({ "error": err.to_string() })),
            )
            .await;
            warn!("{}: {}", task.entity_description(), message);
            return Ok(TaskOutcome::RetryScheduled {
                retry_count,
                max_retries,
            });
        }

        let message = format!("重试次数已用完: {err}");
        let status = if timed_out {
            TaskStatus::Timeout
        } else {
            TaskStatus::Failed
        };
        self.tasks
            .update_status(task.id, status, Some(&message))
            .await?;
        self.log(task.id, LogLevel::Error, &message, None).await;
        error!("{}: {}", task.entity_description(), message);

        Ok(if timed_out {
            TaskOutcome::TimedOut { message }
        } else {
            TaskOutcome::Failed { message }
        })
    }
}

#[async_trait]
impl TaskRunner for ExecutionSandbox {
    async fn run_task(&self, task_id: i64, cancel: CancellationToken) -> PublishResult<TaskOutcome> {
        let task = self.tasks.get_task_for_execution(task_id).await?;
        if task.is_terminal() {
            debug!("任务 {} 已处于终态 {}，跳过", task_id, task.status);
            return Ok(TaskOutcome::Skipped(task.status));
        }

        let deadline = self.deadline_for(&task);

        match self
            .tasks
            .update_status(task_id, TaskStatus::Running, None)
            .await
        {
            Ok(()) => {}
            Err(PublishError::InvalidStateTransition { .. }) => {
                let current = self.tasks.get_task_for_execution(task_id).await?;
                debug!("任务 {} 当前状态 {}，无法开始执行", task_id, current.status);
                return Ok(TaskOutcome::Skipped(current.status));
            }
            Err(e) => return Err(e),
        }
        info!("开始执行{}，截止时间 {:?}", task.entity_description(), deadline);

        let request = ReserveRequest {
            user_id: task.user_id,
            quota_type: PUBLISH_QUOTA.to_string(),
            amount: 1,
            client_id: self.client_id.clone(),
            task_info: Some(json!({
                "taskId": task.id,
                "platform": task.platform_id,
                "articleId": task.article_id,
            })),
        };
        let reservation = match self.ledger.reserve(&request).await {
            Ok(receipt) => receipt,
            Err(e) if e.is_rate_limited() || e.is_rate_limit_exhausted() => {
                self.back_to_pending(task_id, &e.to_string()).await;
                return Err(e);
            }
            Err(e) if e.is_fatal() => {
                let message = e.to_string();
                self.tasks
                    .update_status(task_id, TaskStatus::Failed, Some(&message))
                    .await?;
                self.log(task_id, LogLevel::Error, &message, None).await;
                warn!("任务 {} 预留配额失败: {}", task_id, message);
                return Ok(TaskOutcome::Failed { message });
            }
            Err(e) => {
                warn!("任务 {} 预留配额失败: {}", task_id, e);
                return self.record_retry(&task, e, false).await;
            }
        };
        debug!(
            "任务 {} 预留配额 {}，剩余 {}",
            task_id, reservation.reservation_id, reservation.remaining_quota
        );
        self.log(
            task_id,
            LogLevel::Info,
            "开始发布",
            Some(json!({ "reservationId": reservation.reservation_id })),
        )
        .await;

        match self.drive(&task, &cancel, deadline).await {
            Ok(published) => {
                self.on_success(&task, &reservation.reservation_id, published)
                    .await
            }
            Err(e) => {
                self.on_failure(&task, &reservation.reservation_id, e)
                    .await
            }
        }
    }
}
