use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use publisher_domain::{ReservationStatus, ReserveRequest};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub reservation_id: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub reservation_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReservationQueryParams {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetLimitRequest {
    pub limit: i64,
}

pub async fn reserve_quota(
    State(state): State<AppState>,
    Json(request): Json<ReserveRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state.ledger.reserve(&request).await?;
    Ok(success(receipt))
}

pub async fn confirm_reservation(
    State(state): State<AppState>,
    Json(request): Json<ConfirmRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .ledger
        .confirm(&request.reservation_id, request.result)
        .await?;
    Ok(success(receipt))
}

pub async fn release_reservation(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .ledger
        .release(
            &request.reservation_id,
            request.reason.as_deref(),
            request.error_code.as_deref(),
        )
        .await?;
    Ok(success(receipt))
}

pub async fn get_quota_info(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let info = state.ledger.quota_info(user_id).await?;
    Ok(success(info))
}

pub async fn list_reservations(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(params): Query<ReservationQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<ReservationStatus>)
        .transpose()?;
    let reservations = state.ledger.user_reservations(user_id, status).await?;
    Ok(success(reservations))
}

pub async fn set_quota_limit(
    State(state): State<AppState>,
    Path((user_id, quota_type)): Path<(i64, String)>,
    Json(request): Json<SetLimitRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.limit < 0 {
        return Err(ApiError::BadRequest("配额上限不能为负数".to_string()));
    }
    state
        .ledger
        .set_quota_limit(user_id, &quota_type, request.limit)
        .await?;
    info!("用户 {} 的 {} 配额上限设置为 {}", user_id, quota_type, request.limit);
    Ok(success(json!({
        "userId": user_id,
        "quotaType": quota_type,
        "limit": request.limit,
    })))
}
