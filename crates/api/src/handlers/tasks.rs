use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use publisher_domain::{LogLevel, NewTask, TaskFilter, TaskStatus};
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::{ApiError, ApiResult},
    response::{created, done, success},
    routes::AppState,
};

/// 任务查询参数
#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub user_id: Option<i64>,
    pub status: Option<String>,
    pub batch_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl TaskQueryParams {
    fn into_filter(self) -> ApiResult<TaskFilter> {
        if matches!(self.limit, Some(l) if l < 0) || matches!(self.offset, Some(o) if o < 0) {
            return Err(ApiError::BadRequest("分页参数不能为负数".to_string()));
        }
        let status = self
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()?;
        Ok(TaskFilter {
            user_id: self.user_id,
            status,
            batch_id: self.batch_id,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddLogRequest {
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// 创建任务
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> ApiResult<impl IntoResponse> {
    let task = state.tasks.create_task(&request).await?;
    Ok(created(task))
}

/// 获取任务列表
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = params.into_filter()?;
    let tasks = state.tasks.list_tasks(&filter).await?;
    Ok(success(tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let task = state.tasks.get_task(id).await?;
    Ok(success(task))
}

/// 获取执行所需的完整任务（含正文）
pub async fn get_task_for_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let task = state.tasks.get_task_for_execution(id).await?;
    Ok(success(task))
}

pub async fn update_task_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .tasks
        .update_status(id, request.status, request.error_message.as_deref())
        .await?;
    Ok(done("任务状态已更新"))
}

pub async fn increment_retry_count(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let retry_count = state.tasks.increment_retry_count(id).await?;
    Ok(success(json!({ "retry_count": retry_count })))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.tasks.cancel_task(id).await?;
    Ok(done("任务已取消"))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.tasks.delete_task(id).await?;
    Ok(done("任务已删除"))
}

pub async fn get_task_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let logs = state.tasks.get_logs(id).await?;
    Ok(success(logs))
}

pub async fn add_task_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<AddLogRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .tasks
        .add_log(id, request.level, &request.message, request.details)
        .await?;
    Ok(done("日志已记录"))
}
