//! 领域仓储抽象
//!
//! 服务端以 SQLite 实现，执行端以 HTTP 客户端实现

use async_trait::async_trait;
use publisher_errors::PublishResult;

use crate::entities::{
    BatchInfo, ConfirmReceipt, LogLevel, NewTask, PublishingTask, QuotaInfo, ReleaseReceipt,
    Reservation, ReservationStatus, ReserveReceipt, ReserveRequest, StopBatchResult, TaskFilter,
    TaskLog, TaskStatus, TaskSummary,
};

/// 配额账本：两阶段预留
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn reserve(&self, request: &ReserveRequest) -> PublishResult<ReserveReceipt>;
    async fn confirm(
        &self,
        reservation_id: &str,
        result: Option<serde_json::Value>,
    ) -> PublishResult<ConfirmReceipt>;
    async fn release(
        &self,
        reservation_id: &str,
        reason: Option<&str>,
        error_code: Option<&str>,
    ) -> PublishResult<ReleaseReceipt>;
    async fn quota_info(&self, user_id: i64) -> PublishResult<QuotaInfo>;
    async fn user_reservations(
        &self,
        user_id: i64,
        status: Option<ReservationStatus>,
    ) -> PublishResult<Vec<Reservation>>;
    async fn set_quota_limit(&self, user_id: i64, quota_type: &str, limit: i64)
        -> PublishResult<()>;
}

/// 发布任务仓储，任务状态的唯一修改方
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, task: &NewTask) -> PublishResult<TaskSummary>;
    async fn get_task(&self, id: i64) -> PublishResult<TaskSummary>;
    async fn get_task_for_execution(&self, id: i64) -> PublishResult<PublishingTask>;
    async fn list_tasks(&self, filter: &TaskFilter) -> PublishResult<Vec<TaskSummary>>;
    async fn list_by_batch(&self, batch_id: &str) -> PublishResult<Vec<TaskSummary>>;
    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> PublishResult<()>;
    async fn increment_retry_count(&self, id: i64) -> PublishResult<i32>;
    async fn cancel_task(&self, id: i64) -> PublishResult<()>;
    async fn delete_task(&self, id: i64) -> PublishResult<()>;
    async fn delete_batch(&self, batch_id: &str) -> PublishResult<u64>;
    async fn batch_info(&self, batch_id: &str) -> PublishResult<BatchInfo>;
    async fn stop_batch(&self, batch_id: &str) -> PublishResult<StopBatchResult>;
    async fn add_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> PublishResult<()>;
    async fn get_logs(&self, task_id: i64) -> PublishResult<Vec<TaskLog>>;
}
