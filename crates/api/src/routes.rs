use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use publisher_domain::{QuotaLedger, TaskRepository};
use publisher_infrastructure::BroadcastEventBus;

use crate::handlers::{
    batches::{delete_batch, get_batch_info, list_batch_tasks, stop_batch},
    events::subscribe_events,
    health::health_check,
    quota::{
        confirm_reservation, get_quota_info, list_reservations, release_reservation,
        reserve_quota, set_quota_limit,
    },
    tasks::{
        add_task_log, cancel_task, create_task, delete_task, get_task, get_task_for_execution,
        get_task_logs, increment_retry_count, list_tasks, update_task_status,
    },
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn QuotaLedger>,
    pub tasks: Arc<dyn TaskRepository>,
    pub events: Arc<BroadcastEventBus>,
}

impl AppState {
    pub fn new(
        ledger: Arc<dyn QuotaLedger>,
        tasks: Arc<dyn TaskRepository>,
        events: Arc<BroadcastEventBus>,
    ) -> Self {
        Self {
            ledger,
            tasks,
            events,
        }
    }
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // 配额账本
        .route("/api/quota/reserve", post(reserve_quota))
        .route("/api/quota/confirm", post(confirm_reservation))
        .route("/api/quota/release", post(release_reservation))
        .route("/api/quota/{user_id}", get(get_quota_info))
        .route("/api/quota/{user_id}/reservations", get(list_reservations))
        .route("/api/quota/{user_id}/{quota_type}/limit", put(set_quota_limit))
        // 发布任务
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/execution", get(get_task_for_execution))
        .route("/api/tasks/{id}/status", put(update_task_status))
        .route("/api/tasks/{id}/increment-retry", post(increment_retry_count))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/logs", get(get_task_logs).post(add_task_log))
        // 批次
        .route(
            "/api/batches/{batch_id}",
            get(get_batch_info).delete(delete_batch),
        )
        .route("/api/batches/{batch_id}/tasks", get(list_batch_tasks))
        .route("/api/batches/{batch_id}/stop", post(stop_batch))
        // 通知推送
        .route("/api/users/{user_id}/events", get(subscribe_events))
        .with_state(state)
}
