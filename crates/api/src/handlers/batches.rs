use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::json;
use tracing::info;

use crate::{error::ApiResult, response::success, routes::AppState};

/// 按 batch_order 排列的批次任务
pub async fn list_batch_tasks(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tasks = state.tasks.list_by_batch(&batch_id).await?;
    Ok(success(tasks))
}

pub async fn get_batch_info(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let info = state.tasks.batch_info(&batch_id).await?;
    Ok(success(info))
}

pub async fn stop_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let result = state.tasks.stop_batch(&batch_id).await?;
    info!(
        "批次 {} 已停止: 取消 {} 个，终止 {} 个",
        batch_id, result.cancelled_count, result.terminated_count
    );
    Ok(success(result))
}

pub async fn delete_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state.tasks.delete_batch(&batch_id).await?;
    Ok(success(json!({ "deleted": deleted })))
}
