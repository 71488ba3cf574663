use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use publisher_errors::PublishError;
use serde::{Deserialize, Serialize};

/// 计量配额类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    ArticleGeneration,
    Publish,
    KnowledgeUpload,
    ImageUpload,
}

impl QuotaType {
    pub const ALL: [QuotaType; 4] = [
        QuotaType::ArticleGeneration,
        QuotaType::Publish,
        QuotaType::KnowledgeUpload,
        QuotaType::ImageUpload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::ArticleGeneration => "article_generation",
            QuotaType::Publish => "publish",
            QuotaType::KnowledgeUpload => "knowledge_upload",
            QuotaType::ImageUpload => "image_upload",
        }
    }
}

impl FromStr for QuotaType {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuotaType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PublishError::InvalidQuotaType(s.to_string()))
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationStatus::Reserved),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "released" => Ok(ReservationStatus::Released),
            "expired" => Ok(ReservationStatus::Expired),
            _ => Err(PublishError::invalid_params(format!("未知的预留状态: {s}"))),
        }
    }
}

/// 配额预留记录，只会从 reserved 迁出一次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub user_id: i64,
    pub quota_type: QuotaType,
    pub amount: i64,
    pub status: ReservationStatus,
    pub client_id: Option<String>,
    pub task_info: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub user_id: i64,
    pub quota_type: String,
    #[serde(default = "default_amount")]
    pub amount: i64,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub task_info: Option<serde_json::Value>,
}

fn default_amount() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReserveReceipt {
    pub reservation_id: String,
    pub expires_at: DateTime<Utc>,
    pub remaining_quota: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmReceipt {
    pub consumed: i64,
    pub remaining_quota: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReceipt {
    pub released: i64,
    pub remaining_quota: i64,
}

/// 单个配额类型的账面
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QuotaBalance {
    pub used: i64,
    pub limit: i64,
    pub reserved: i64,
    pub available: i64,
}

impl QuotaBalance {
    pub fn new(limit: i64, used: i64, reserved: i64) -> Self {
        Self {
            used,
            limit,
            reserved,
            available: (limit - used - reserved).max(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaInfo {
    pub user_id: i64,
    pub quotas: BTreeMap<String, QuotaBalance>,
}

impl QuotaInfo {
    pub fn balance(&self, quota_type: QuotaType) -> QuotaBalance {
        self.quotas
            .get(quota_type.as_str())
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// 状态机迁移规则；终态到自身视为幂等更新
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => true,
            TaskStatus::Running => next != TaskStatus::Running,
            terminal => *terminal == next,
        }
    }
}

impl FromStr for TaskStatus {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "timeout" => Ok(TaskStatus::Timeout),
            _ => Err(PublishError::invalid_params(format!("未知的任务状态: {s}"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 创建任务时固化的文章内容
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ArticleSnapshot {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub keyword: Option<String>,
}

/// 执行所需的完整任务（含正文快照）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingTask {
    pub id: i64,
    pub user_id: i64,
    pub article_id: Option<i64>,
    pub batch_id: Option<String>,
    pub batch_order: i32,
    pub snapshot: ArticleSnapshot,
    pub account_id: i64,
    pub platform_id: String,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub interval_minutes: i32,
    pub timeout_minutes: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishingTask {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn entity_description(&self) -> String {
        format!(
            "发布任务 '{}' (ID: {}, 平台: {})",
            self.snapshot.title, self.id, self.platform_id
        )
    }
}

/// 列表投影，不含正文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: i64,
    pub user_id: i64,
    pub article_id: Option<i64>,
    pub batch_id: Option<String>,
    pub batch_order: i32,
    pub title: String,
    pub keyword: Option<String>,
    pub account_id: i64,
    pub platform_id: String,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub interval_minutes: i32,
    pub timeout_minutes: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: i64,
    #[serde(default)]
    pub article_id: Option<i64>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub batch_order: i32,
    pub snapshot: ArticleSnapshot,
    pub account_id: i64,
    pub platform_id: String,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval_minutes: i32,
    #[serde(default)]
    pub timeout_minutes: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

impl NewTask {
    pub fn new(user_id: i64, account_id: i64, platform_id: &str, snapshot: ArticleSnapshot) -> Self {
        Self {
            user_id,
            article_id: None,
            batch_id: None,
            batch_order: 0,
            snapshot,
            account_id,
            platform_id: platform_id.to_string(),
            scheduled_at: None,
            interval_minutes: 0,
            timeout_minutes: None,
            max_retries: None,
        }
    }

    pub fn in_batch(mut self, batch_id: &str, batch_order: i32) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self.batch_order = batch_order;
        self
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), PublishError> {
        if self.platform_id.trim().is_empty() {
            return Err(PublishError::invalid_params("平台标识不能为空"));
        }
        if self.interval_minutes < 0 {
            return Err(PublishError::invalid_params("发布间隔不能为负数"));
        }
        if matches!(self.timeout_minutes, Some(m) if m <= 0) {
            return Err(PublishError::invalid_params("超时时间必须大于 0"));
        }
        if matches!(self.max_retries, Some(r) if r < 0) {
            return Err(PublishError::invalid_params("最大重试次数不能为负数"));
        }
        if let Some(scheduled_at) = self.scheduled_at {
            if scheduled_at <= now {
                return Err(PublishError::invalid_params("定时发布时间必须晚于当前时间"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub user_id: Option<i64>,
    pub status: Option<TaskStatus>,
    pub batch_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BatchInfo {
    pub batch_id: String,
    pub total_tasks: i64,
    pub pending_tasks: i64,
    pub running_tasks: i64,
    pub success_tasks: i64,
    pub failed_tasks: i64,
    pub cancelled_tasks: i64,
    pub timeout_tasks: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StopBatchResult {
    pub cancelled_count: i64,
    pub terminated_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(PublishError::invalid_params(format!("未知的日志级别: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// 被发布的文章
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub keyword: Option<String>,
    pub publishing_status: Option<String>,
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
}

impl Article {
    pub fn snapshot(&self) -> ArticleSnapshot {
        ArticleSnapshot {
            title: self.title.clone(),
            content: self.content.clone(),
            keyword: self.keyword.clone(),
        }
    }
}
