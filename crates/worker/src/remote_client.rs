//! 执行端访问远程账本与任务服务的 HTTP 客户端

use std::time::Duration;

use async_trait::async_trait;
use publisher_config::AgentConfig;
use publisher_domain::{
    BatchInfo, ConfirmReceipt, LogLevel, NewTask, PublishingTask, QuotaInfo, QuotaLedger,
    ReleaseReceipt, Reservation, ReservationStatus, ReserveReceipt, ReserveRequest,
    StopBatchResult, TaskFilter, TaskLog, TaskRepository, TaskStatus, TaskSummary,
};
use publisher_errors::{PublishError, PublishResult, RATE_LIMITED};
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const DEFAULT_CLIENT_ID: &str = "publisher-agent";

pub struct RemoteClient {
    base_url: String,
    client_id: String,
    http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct RetryCount {
    retry_count: i32,
}

#[derive(Deserialize)]
struct Deleted {
    deleted: u64,
}

impl RemoteClient {
    pub fn new(base_url: &str, client_id: String, timeout: Duration) -> PublishResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::config_error(format!("创建 HTTP 客户端失败: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            http_client,
        })
    }

    /// 未配置 client_id 时使用主机名
    pub fn from_config(config: &AgentConfig) -> PublishResult<Self> {
        let client_id = config
            .client_id
            .clone()
            .or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|name| name.into_string().ok())
            })
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
        Self::new(
            &config.server_url,
            client_id,
            Duration::from_secs(config.request_timeout_seconds),
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> PublishResult<T> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = match response.json::<Value>().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(PublishError::Serialization(format!("无法解析服务端响应: {e}")))
            }
            Err(_) => Value::Null,
        };

        if !status.is_success() {
            let err = decode_error(status.as_u16(), &body, retry_after);
            if status.is_server_error() {
                warn!("远程服务返回错误: HTTP {} {}", status, err);
            } else {
                debug!("远程服务返回错误: HTTP {} {}", status, err);
            }
            return Err(err);
        }

        let data = body.get("data").cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(data)?)
    }
}

fn transport_error(err: reqwest::Error) -> PublishError {
    if err.is_timeout() {
        PublishError::Timeout(format!("请求远程服务超时: {err}"))
    } else {
        PublishError::Network(format!("无法连接远程服务: {err}"))
    }
}

/// 把 `{error: {code, message, details}}` 还原为本地错误类型
fn decode_error(status: u16, body: &Value, retry_after: Option<Duration>) -> PublishError {
    let error = &body["error"];
    let Some(code) = error["code"].as_str() else {
        if status == 429 {
            return PublishError::rate_limited(RATE_LIMITED, "服务端限流", retry_after);
        }
        return PublishError::Remote {
            status,
            code: format!("HTTP_{status}"),
            message: body.to_string(),
        };
    };
    let message = error["message"].as_str().unwrap_or_default().to_string();
    let details = &error["details"];

    let decoded = match code {
        "TASK_NOT_FOUND" => details["id"]
            .as_i64()
            .map(|id| PublishError::TaskNotFound { id }),
        "RESERVATION_NOT_FOUND" => details["id"]
            .as_str()
            .map(|id| PublishError::ReservationNotFound { id: id.to_string() }),
        "RESERVATION_EXPIRED" => details["id"]
            .as_str()
            .map(|id| PublishError::ReservationExpired { id: id.to_string() }),
        "INSUFFICIENT_QUOTA" => details["quotaType"].as_str().map(|quota_type| {
            PublishError::InsufficientQuota {
                quota_type: quota_type.to_string(),
                requested: details["requested"].as_i64().unwrap_or_default(),
                available: details["available"].as_i64().unwrap_or_default(),
            }
        }),
        "INVALID_STATE_TRANSITION" => details["id"].as_i64().map(|id| {
            PublishError::InvalidStateTransition {
                id,
                from: details["from"].as_str().unwrap_or_default().to_string(),
                to: details["to"].as_str().unwrap_or_default().to_string(),
            }
        }),
        _ => None,
    };

    decoded.unwrap_or_else(|| {
        let message = details["reason"]
            .as_str()
            .map(str::to_string)
            .unwrap_or(message);
        PublishError::from_code(status, code, message, retry_after)
    })
}

#[async_trait]
impl QuotaLedger for RemoteClient {
    async fn reserve(&self, request: &ReserveRequest) -> PublishResult<ReserveReceipt> {
        let mut request = request.clone();
        if request.client_id.is_none() {
            request.client_id = Some(self.client_id.clone());
        }
        self.execute(
            self.http_client
                .post(self.url("/api/quota/reserve"))
                .json(&request),
        )
        .await
    }

    async fn confirm(
        &self,
        reservation_id: &str,
        result: Option<Value>,
    ) -> PublishResult<ConfirmReceipt> {
        self.execute(
            self.http_client
                .post(self.url("/api/quota/confirm"))
                .json(&json!({ "reservationId": reservation_id, "result": result })),
        )
        .await
    }

    async fn release(
        &self,
        reservation_id: &str,
        reason: Option<&str>,
        error_code: Option<&str>,
    ) -> PublishResult<ReleaseReceipt> {
        self.execute(self.http_client.post(self.url("/api/quota/release")).json(&json!({
            "reservationId": reservation_id,
            "reason": reason,
            "errorCode": error_code,
        })))
        .await
    }

    async fn quota_info(&self, user_id: i64) -> PublishResult<QuotaInfo> {
        self.execute(self.http_client.get(self.url(&format!("/api/quota/{user_id}"))))
            .await
    }

    async fn user_reservations(
        &self,
        user_id: i64,
        status: Option<ReservationStatus>,
    ) -> PublishResult<Vec<Reservation>> {
        let mut request = self
            .http_client
            .get(self.url(&format!("/api/quota/{user_id}/reservations")));
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }
        self.execute(request).await
    }

    async fn set_quota_limit(&self, user_id: i64, quota_type: &str, limit: i64) -> PublishResult<()> {
        let _: Value = self
            .execute(
                self.http_client
                    .put(self.url(&format!("/api/quota/{user_id}/{quota_type}/limit")))
                    .json(&json!({ "limit": limit })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for RemoteClient {
    async fn create_task(&self, task: &NewTask) -> PublishResult<TaskSummary> {
        self.execute(self.http_client.post(self.url("/api/tasks")).json(task))
            .await
    }

    async fn get_task(&self, id: i64) -> PublishResult<TaskSummary> {
        self.execute(self.http_client.get(self.url(&format!("/api/tasks/{id}"))))
            .await
    }

    async fn get_task_for_execution(&self, id: i64) -> PublishResult<PublishingTask> {
        self.execute(
            self.http_client
                .get(self.url(&format!("/api/tasks/{id}/execution"))),
        )
        .await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> PublishResult<Vec<TaskSummary>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(user_id) = filter.user_id {
            query.push(("user_id", user_id.to_string()));
        }
        if let Some(status) = filter.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(batch_id) = &filter.batch_id {
            query.push(("batch_id", batch_id.clone()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(offset) = filter.offset {
            query.push(("offset", offset.to_string()));
        }
        self.execute(self.http_client.get(self.url("/api/tasks")).query(&query))
            .await
    }

    async fn list_by_batch(&self, batch_id: &str) -> PublishResult<Vec<TaskSummary>> {
        self.execute(
            self.http_client
                .get(self.url(&format!("/api/batches/{batch_id}/tasks"))),
        )
        .await
    }

    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> PublishResult<()> {
        self.execute(
            self.http_client
                .put(self.url(&format!("/api/tasks/{id}/status")))
                .json(&json!({ "status": status, "error_message": error_message })),
        )
        .await
    }

    async fn increment_retry_count(&self, id: i64) -> PublishResult<i32> {
        let body: RetryCount = self
            .execute(
                self.http_client
                    .post(self.url(&format!("/api/tasks/{id}/increment-retry"))),
            )
            .await?;
        Ok(body.retry_count)
    }

    async fn cancel_task(&self, id: i64) -> PublishResult<()> {
        self.execute(
            self.http_client
                .post(self.url(&format!("/api/tasks/{id}/cancel"))),
        )
        .await
    }

    async fn delete_task(&self, id: i64) -> PublishResult<()> {
        self.execute(self.http_client.delete(self.url(&format!("/api/tasks/{id}"))))
            .await
    }

    async fn delete_batch(&self, batch_id: &str) -> PublishResult<u64> {
        let body: Deleted = self
            .execute(
                self.http_client
                    .delete(self.url(&format!("/api/batches/{batch_id}"))),
            )
            .await?;
        Ok(body.deleted)
    }

    async fn batch_info(&self, batch_id: &str) -> PublishResult<BatchInfo> {
        self.execute(
            self.http_client
                .get(self.url(&format!("/api/batches/{batch_id}"))),
        )
        .await
    }

    async fn stop_batch(&self, batch_id: &str) -> PublishResult<StopBatchResult> {
        self.execute(
            self.http_client
                .post(self.url(&format!("/api/batches/{batch_id}/stop"))),
        )
        .await
    }

    async fn add_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: &str,
        details: Option<Value>,
    ) -> PublishResult<()> {
        self.execute(
            self.http_client
                .post(self.url(&format!("/api/tasks/{task_id}/logs")))
                .json(&json!({ "level": level, "message": message, "details": details })),
        )
        .await
    }

    async fn get_logs(&self, task_id: i64) -> PublishResult<Vec<TaskLog>> {
        self.execute(
            self.http_client
                .get(self.url(&format!("/api/tasks/{task_id}/logs"))),
        )
        .await
    }
}
