use std::time::Duration;

use thiserror::Error;


/// 限流错误码：服务端间隔控制
pub const INTERVAL_CONTROL: &str = "INTERVAL_CONTROL";
/// 限流错误码：服务端并发控制
pub const CONCURRENCY_CONTROL: &str = "CONCURRENCY_CONTROL";
/// 限流错误码：通用 429
pub const RATE_LIMITED: &str = "RATE_LIMITED";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("预留记录不存在或已处理: {id}")]
    ReservationNotFound { id: String },
    #[error("预留已过期: {id}")]
    ReservationExpired { id: String },
    #[error("配额不足: {quota_type} 需要 {requested}，剩余 {available}")]
    InsufficientQuota {
        quota_type: String,
        requested: i64,
        available: i64,
    },
    #[error("无效的配额类型: {0}")]
    InvalidQuotaType(String),
    #[error("配额扣减失败: {0}")]
    ConsumeFailed(String),
    #[error("无效的状态转换: 任务 {id} 从 {from} 到 {to}")]
    InvalidStateTransition { id: i64, from: String, to: String },
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("触发{}: {message}", rate_limit_label(.code))]
    RateLimited {
        code: String,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("重试 {attempts} 次后仍触发限流: {message}")]
    RateLimitExhausted { attempts: u32, message: String },
    #[error("任务执行超时: 任务 {task_id} 超过 {deadline:?}")]
    DeadlineExceeded { task_id: i64, deadline: Duration },
    #[error("任务已取消: {0}")]
    Cancelled(String),
    #[error("浏览器自动化错误: {0}")]
    Automation(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("远程服务错误: [{code}] {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type PublishResult<T> = Result<T, PublishError>;

/// 限流原因的中文描述
pub fn rate_limit_label(code: &str) -> &'static str {
    match code {
        INTERVAL_CONTROL => "间隔控制",
        CONCURRENCY_CONTROL => "并发控制",
        _ => "限流",
    }
}

/// 是否为限流类错误码
pub fn is_rate_limit_code(code: &str) -> bool {
    matches!(code, INTERVAL_CONTROL | CONCURRENCY_CONTROL | RATE_LIMITED)
}

impl PublishError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn reservation_not_found<S: Into<String>>(id: S) -> Self {
        Self::ReservationNotFound { id: id.into() }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn automation<S: Into<String>>(msg: S) -> Self {
        Self::Automation(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn rate_limited<C: Into<String>, M: Into<String>>(
        code: C,
        message: M,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::RateLimited {
            code: code.into(),
            message: message.into(),
            retry_after,
        }
    }

    /// 根据远程响应中的错误码还原结构化错误，无法识别的落入 `Remote`
    pub fn from_code(
        status: u16,
        code: &str,
        message: String,
        retry_after: Option<Duration>,
    ) -> Self {
        if status == 429 || is_rate_limit_code(code) {
            let code = if is_rate_limit_code(code) { code } else { RATE_LIMITED };
            return Self::rate_limited(code, message, retry_after);
        }
        match code {
            "INVALID_QUOTA_TYPE" => Self::InvalidQuotaType(message),
            "CONSUME_FAILED" => Self::ConsumeFailed(message),
            "INVALID_TASK_PARAMS" => Self::InvalidTaskParams(message),
            _ => Self::Remote {
                status,
                code: code.to_string(),
                message,
            },
        }
    }

    /// 对外暴露的机器可读错误码
    pub fn error_code(&self) -> &str {
        match self {
            PublishError::Database(_) | PublishError::DatabaseOperation(_) => "DATABASE_ERROR",
            PublishError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            PublishError::ReservationNotFound { .. } => "RESERVATION_NOT_FOUND",
            PublishError::ReservationExpired { .. } => "RESERVATION_EXPIRED",
            PublishError::InsufficientQuota { .. } => "INSUFFICIENT_QUOTA",
            PublishError::InvalidQuotaType(_) => "INVALID_QUOTA_TYPE",
            PublishError::ConsumeFailed(_) => "CONSUME_FAILED",
            PublishError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            PublishError::InvalidTaskParams(_) => "INVALID_TASK_PARAMS",
            PublishError::RateLimited { code, .. } => code,
            PublishError::RateLimitExhausted { .. } => "RATE_LIMIT_EXHAUSTED",
            PublishError::DeadlineExceeded { .. } | PublishError::Timeout(_) => "TIMEOUT",
            PublishError::Cancelled(_) => "CANCELLED",
            PublishError::Automation(_) => "EXECUTION_FAILED",
            PublishError::Network(_) => "NETWORK_ERROR",
            PublishError::Remote { code, .. } => code,
            PublishError::Serialization(_) => "SERIALIZATION_ERROR",
            PublishError::Configuration(_) => "CONFIGURATION_ERROR",
            PublishError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 服务端限流（429），由退避控制器吸收
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PublishError::RateLimited { .. })
    }

    /// 限流放弃，不计入任务重试次数
    pub fn is_rate_limit_exhausted(&self) -> bool {
        matches!(self, PublishError::RateLimitExhausted { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PublishError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PublishError::Cancelled(_))
    }

    /// 重试也无法恢复的错误，任务应直接进入终态
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PublishError::InsufficientQuota { .. }
                | PublishError::InvalidQuotaType(_)
                | PublishError::InvalidTaskParams(_)
                | PublishError::TaskNotFound { .. }
                | PublishError::Configuration(_)
        )
    }

    /// 瞬时错误，同一请求稍后重发可能成功
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::DatabaseOperation(_)
            | PublishError::Network(_)
            | PublishError::Timeout(_)
            | PublishError::Automation(_)
            | PublishError::DeadlineExceeded { .. } => true,
            PublishError::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn user_message(&self) -> &str {
        match self {
            PublishError::TaskNotFound { .. } => "请求的任务不存在",
            PublishError::ReservationNotFound { .. } => "预留记录不存在或已处理",
            PublishError::ReservationExpired { .. } => "预留已过期，请重新预扣减配额",
            PublishError::InsufficientQuota { .. } => "配额不足，请升级套餐或购买加量包",
            PublishError::InvalidQuotaType(_) => "无效的配额类型",
            PublishError::ConsumeFailed(_) => "配额扣减失败，请稍后重试",
            PublishError::InvalidStateTransition { .. } => "任务当前状态不允许该操作",
            PublishError::InvalidTaskParams(_) => "任务参数配置有误",
            PublishError::RateLimited { .. } => "请求过于频繁，请稍后重试",
            PublishError::RateLimitExhausted { .. } => "服务端持续限流，已放弃本次操作",
            PublishError::DeadlineExceeded { .. } | PublishError::Timeout(_) => {
                "操作超时，请稍后重试"
            }
            PublishError::Cancelled(_) => "任务已被取消",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(err: serde_json::Error) -> Self {
        PublishError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for PublishError {
    fn from(err: anyhow::Error) -> Self {
        PublishError::Internal(err.to_string())
    }
}
