//! # Publisher API
//!
//! 账本与任务状态服务的 REST 接口，执行端通过它完成配额预留和状态上报。
//!
//! ## API 端点
//!
//! ### 配额账本
//! - `POST /api/quota/reserve` - 预扣减配额
//! - `POST /api/quota/confirm` - 确认扣减
//! - `POST /api/quota/release` - 释放预留
//! - `GET /api/quota/{user_id}` - 配额概况
//! - `GET /api/quota/{user_id}/reservations` - 最近的预留记录
//! - `PUT /api/quota/{user_id}/{quota_type}/limit` - 设置配额上限
//!
//! ### 发布任务
//! - `POST /api/tasks` / `GET /api/tasks` - 创建 / 列表
//! - `GET /api/tasks/{id}` / `GET /api/tasks/{id}/execution` - 摘要 / 含正文快照
//! - `PUT /api/tasks/{id}/status` - 状态迁移
//! - `POST /api/tasks/{id}/increment-retry` - 记录一次真实失败
//! - `POST /api/tasks/{id}/cancel` / `DELETE /api/tasks/{id}`
//! - `GET /api/tasks/{id}/logs` / `POST /api/tasks/{id}/logs`
//!
//! ### 批次
//! - `GET /api/batches/{batch_id}` / `DELETE /api/batches/{batch_id}`
//! - `GET /api/batches/{batch_id}/tasks`
//! - `POST /api/batches/{batch_id}/stop`
//!
//! ### 通知
//! - `GET /api/users/{user_id}/events` - SSE 事件流
//!
//! ## 错误响应
//! ```json
//! {
//!   "success": false,
//!   "error": { "code": "INSUFFICIENT_QUOTA", "message": "...", "hint": "..." },
//!   "timestamp": "2024-01-01T00:00:00Z"
//! }
//! ```
//! 限流错误返回 429 并带 `Retry-After` 头。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use publisher_config::ApiConfig;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState, config: &ApiConfig) -> Router {
    let app = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );

    if config.cors_enabled {
        app.layer(cors_layer())
    } else {
        app
    }
}
