use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use publisher_errors::{is_rate_limit_code, PublishError};
use serde_json::{json, Value};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Publish(err) => status_for_code(err.error_code()),
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Publish(err) => err.error_code(),
        }
    }

    /// 供客户端还原结构化错误的附加字段
    fn details(&self) -> Value {
        match self {
            ApiError::Publish(PublishError::TaskNotFound { id }) => json!({ "id": id }),
            ApiError::Publish(
                PublishError::ReservationNotFound { id } | PublishError::ReservationExpired { id },
            ) => json!({ "id": id }),
            ApiError::Publish(PublishError::InsufficientQuota {
                quota_type,
                requested,
                available,
            }) => json!({
                "quotaType": quota_type,
                "requested": requested,
                "available": available,
            }),
            ApiError::Publish(PublishError::InvalidStateTransition { id, from, to }) => {
                json!({ "id": id, "from": from, "to": to })
            }
            ApiError::Publish(
                PublishError::InvalidQuotaType(reason)
                | PublishError::ConsumeFailed(reason)
                | PublishError::InvalidTaskParams(reason),
            ) => json!({ "reason": reason }),
            _ => Value::Null,
        }
    }
}

/// 错误码到 HTTP 状态码的映射，执行端按相同规则还原错误
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "INVALID_QUOTA_TYPE" | "INVALID_TASK_PARAMS" | "INVALID_STATE_TRANSITION" => {
            StatusCode::BAD_REQUEST
        }
        "TASK_NOT_FOUND" | "RESERVATION_NOT_FOUND" => StatusCode::NOT_FOUND,
        "INSUFFICIENT_QUOTA" | "CONSUME_FAILED" => StatusCode::CONFLICT,
        "RESERVATION_EXPIRED" => StatusCode::GONE,
        code if is_rate_limit_code(code) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, hint) = match &self {
            ApiError::BadRequest(msg) => (msg.clone(), "请检查请求格式和参数".to_string()),
            ApiError::Publish(err) => (err.to_string(), err.user_message().to_string()),
        };

        if status.is_server_error() {
            error!("请求处理失败: [{}] {}", self.error_code(), message);
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.error_code(),
                "message": message,
                "hint": hint,
                "details": self.details(),
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        let mut response = (status, body).into_response();
        if let ApiError::Publish(err) = &self {
            if let Some(retry_after) = err.retry_after() {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
