#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use publisher_domain::{
    ArticleSnapshot, BatchInfo, ConfirmReceipt, LogLevel, NewTask, PublishingTask, QuotaInfo,
    QuotaLedger, ReleaseReceipt, Reservation, ReservationStatus, ReserveReceipt, ReserveRequest,
    StopBatchResult, TaskFilter, TaskLog, TaskRepository, TaskStatus, TaskSummary,
};
use publisher_errors::{PublishError, PublishResult, INTERVAL_CONTROL};
use publisher_worker::{AutomationLauncher, AutomationSession, TaskOutcome, TaskRunner};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub fn make_task(id: i64, batch_id: Option<&str>, batch_order: i32) -> PublishingTask {
    PublishingTask {
        id,
        user_id: 1,
        article_id: Some(100 + id),
        batch_id: batch_id.map(str::to_string),
        batch_order,
        snapshot: ArticleSnapshot {
            title: format!("文章 {id}"),
            content: "正文".to_string(),
            keyword: None,
        },
        account_id: 9,
        platform_id: "zhihu".to_string(),
        status: TaskStatus::Pending,
        retry_count: 0,
        max_retries: 3,
        scheduled_at: None,
        interval_minutes: 0,
        timeout_minutes: None,
        started_at: None,
        completed_at: None,
        error_message: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn summary_of(task: &PublishingTask) -> TaskSummary {
    TaskSummary {
        id: task.id,
        user_id: task.user_id,
        article_id: task.article_id,
        batch_id: task.batch_id.clone(),
        batch_order: task.batch_order,
        title: task.snapshot.title.clone(),
        keyword: task.snapshot.keyword.clone(),
        account_id: task.account_id,
        platform_id: task.platform_id.clone(),
        status: task.status,
        retry_count: task.retry_count,
        max_retries: task.max_retries,
        scheduled_at: task.scheduled_at,
        interval_minutes: task.interval_minutes,
        timeout_minutes: task.timeout_minutes,
        started_at: task.started_at,
        completed_at: task.completed_at,
        error_message: task.error_message.clone(),
        created_at: task.created_at,
        updated_at: task.updated_at,
    }
}

/// 内存任务仓储，遵循与服务端相同的状态迁移规则
#[derive(Default)]
pub struct MockTaskRepository {
    tasks: Mutex<HashMap<i64, PublishingTask>>,
    logs: Mutex<Vec<(i64, LogLevel, String)>>,
    next_id: AtomicU32,
}

impl MockTaskRepository {
    pub fn with_tasks(tasks: Vec<PublishingTask>) -> Arc<Self> {
        let repo = Self::default();
        {
            let mut map = repo.tasks.lock().unwrap();
            for task in tasks {
                map.insert(task.id, task);
            }
        }
        Arc::new(repo)
    }

    pub fn task(&self, id: i64) -> PublishingTask {
        self.tasks.lock().unwrap()[&id].clone()
    }

    /// 绕过状态机直接设置状态
    pub fn force_status(&self, id: i64, status: TaskStatus) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(&id) {
            task.status = status;
        }
    }

    pub fn log_messages(&self, id: i64) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(task_id, _, _)| *task_id == id)
            .map(|(_, _, message)| message.clone())
            .collect()
    }

    fn find(&self, id: i64) -> PublishResult<PublishingTask> {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(PublishError::TaskNotFound { id })
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn create_task(&self, task: &NewTask) -> PublishResult<TaskSummary> {
        let id = 1000 + self.next_id.fetch_add(1, Ordering::SeqCst) as i64;
        let mut created = make_task(id, task.batch_id.as_deref(), task.batch_order);
        created.snapshot = task.snapshot.clone();
        let summary = summary_of(&created);
        self.tasks.lock().unwrap().insert(id, created);
        Ok(summary)
    }

    async fn get_task(&self, id: i64) -> PublishResult<TaskSummary> {
        self.find(id).map(|task| summary_of(&task))
    }

    async fn get_task_for_execution(&self, id: i64) -> PublishResult<PublishingTask> {
        self.find(id)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> PublishResult<Vec<TaskSummary>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.batch_id.is_none() || t.batch_id == filter.batch_id)
            .map(summary_of)
            .collect())
    }

    async fn list_by_batch(&self, batch_id: &str) -> PublishResult<Vec<TaskSummary>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks
            .values()
            .filter(|t| t.batch_id.as_deref() == Some(batch_id))
            .map(summary_of)
            .collect())
    }

    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> PublishResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&id).ok_or(PublishError::TaskNotFound { id })?;
        if !task.status.can_transition_to(status) {
            return Err(PublishError::InvalidStateTransition {
                id,
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }
        task.status = status;
        task.error_message = error_message.map(str::to_string);
        if status == TaskStatus::Running {
            task.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: i64) -> PublishResult<i32> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&id).ok_or(PublishError::TaskNotFound { id })?;
        task.retry_count += 1;
        Ok(task.retry_count)
    }

    async fn cancel_task(&self, id: i64) -> PublishResult<()> {
        self.update_status(id, TaskStatus::Cancelled, Some("任务已被取消"))
            .await
    }

    async fn delete_task(&self, id: i64) -> PublishResult<()> {
        self.tasks.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn delete_batch(&self, batch_id: &str) -> PublishResult<u64> {
        let mut tasks = self.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|_, t| t.batch_id.as_deref() != Some(batch_id));
        Ok((before - tasks.len()) as u64)
    }

    async fn batch_info(&self, batch_id: &str) -> PublishResult<BatchInfo> {
        let tasks = self.tasks.lock().unwrap();
        let mut info = BatchInfo {
            batch_id: batch_id.to_string(),
            ..Default::default()
        };
        for task in tasks.values().filter(|t| t.batch_id.as_deref() == Some(batch_id)) {
            info.total_tasks += 1;
            match task.status {
                TaskStatus::Pending => info.pending_tasks += 1,
                TaskStatus::Running => info.running_tasks += 1,
                TaskStatus::Success => info.success_tasks += 1,
                TaskStatus::Failed => info.failed_tasks += 1,
                TaskStatus::Cancelled => info.cancelled_tasks += 1,
                TaskStatus::Timeout => info.timeout_tasks += 1,
            }
        }
        Ok(info)
    }

    async fn stop_batch(&self, batch_id: &str) -> PublishResult<StopBatchResult> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut result = StopBatchResult::default();
        for task in tasks
            .values_mut()
            .filter(|t| t.batch_id.as_deref() == Some(batch_id))
        {
            match task.status {
                TaskStatus::Pending => {
                    task.status = TaskStatus::Cancelled;
                    result.cancelled_count += 1;
                }
                TaskStatus::Running => {
                    task.status = TaskStatus::Cancelled;
                    result.terminated_count += 1;
                }
                _ => {}
            }
        }
        Ok(result)
    }

    async fn add_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: &str,
        _details: Option<serde_json::Value>,
    ) -> PublishResult<()> {
        self.logs
            .lock()
            .unwrap()
            .push((task_id, level, message.to_string()));
        Ok(())
    }

    async fn get_logs(&self, _task_id: i64) -> PublishResult<Vec<TaskLog>> {
        Ok(Vec::new())
    }
}

/// 记录调用的配额账本，可以预设限流次数或配额不足
#[derive(Default)]
pub struct MockQuotaLedger {
    pub calls: Mutex<Vec<String>>,
    rate_limited_reserves: AtomicU32,
    insufficient: AtomicBool,
    next_id: AtomicU32,
}

impl MockQuotaLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rate_limit_next_reserves(&self, times: u32) {
        self.rate_limited_reserves.store(times, Ordering::SeqCst);
    }

    pub fn exhaust_quota(&self) {
        self.insufficient.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl QuotaLedger for MockQuotaLedger {
    async fn reserve(&self, request: &ReserveRequest) -> PublishResult<ReserveReceipt> {
        self.calls.lock().unwrap().push("reserve".to_string());
        if self.insufficient.load(Ordering::SeqCst) {
            return Err(PublishError::InsufficientQuota {
                quota_type: request.quota_type.clone(),
                requested: request.amount,
                available: 0,
            });
        }
        let limited = self
            .rate_limited_reserves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(PublishError::rate_limited(
                INTERVAL_CONTROL,
                "发布间隔未到",
                Some(Duration::from_secs(2)),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ReserveReceipt {
            reservation_id: format!("r-{id}"),
            expires_at: Utc::now() + chrono::Duration::minutes(10),
            remaining_quota: 10,
        })
    }

    async fn confirm(
        &self,
        reservation_id: &str,
        _result: Option<serde_json::Value>,
    ) -> PublishResult<ConfirmReceipt> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("confirm:{reservation_id}"));
        Ok(ConfirmReceipt {
            consumed: 1,
            remaining_quota: 9,
        })
    }

    async fn release(
        &self,
        reservation_id: &str,
        _reason: Option<&str>,
        error_code: Option<&str>,
    ) -> PublishResult<ReleaseReceipt> {
        self.calls.lock().unwrap().push(format!(
            "release:{reservation_id}:{}",
            error_code.unwrap_or_default()
        ));
        Ok(ReleaseReceipt {
            released: 1,
            remaining_quota: 10,
        })
    }

    async fn quota_info(&self, user_id: i64) -> PublishResult<QuotaInfo> {
        Ok(QuotaInfo {
            user_id,
            quotas: Default::default(),
        })
    }

    async fn user_reservations(
        &self,
        _user_id: i64,
        _status: Option<ReservationStatus>,
    ) -> PublishResult<Vec<Reservation>> {
        Ok(Vec::new())
    }

    async fn set_quota_limit(&self, _user_id: i64, _quota_type: &str, _limit: i64) -> PublishResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    /// 一直不返回，直到被取消或强制关闭
    Hang,
    /// 发布成功，但优雅关闭报错
    CloseFails,
    /// 发布成功，但优雅关闭一直不返回
    CloseHangs,
    /// 启动会话一直不返回
    LaunchHangs,
}

pub struct MockSession {
    behavior: Behavior,
    alive: AtomicBool,
    killed: CancellationToken,
    pub closed: AtomicBool,
    pub force_closed_at: Mutex<Option<Instant>>,
}

impl MockSession {
    pub fn was_force_closed(&self) -> bool {
        self.force_closed_at.lock().unwrap().is_some()
    }
}

#[async_trait]
impl AutomationSession for MockSession {
    async fn login(&self) -> PublishResult<()> {
        Ok(())
    }

    async fn publish(&self, cancel: &CancellationToken) -> PublishResult<serde_json::Value> {
        match &self.behavior {
            Behavior::Succeed | Behavior::CloseFails | Behavior::CloseHangs => {
                Ok(serde_json::json!({ "url": "https://example.com/p/1" }))
            }
            Behavior::Fail(message) => Err(PublishError::automation(message.clone())),
            Behavior::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(PublishError::Cancelled("发布被取消".to_string())),
                    _ = self.killed.cancelled() => Err(PublishError::automation("会话已被强制关闭")),
                }
            }
            Behavior::LaunchHangs => unreachable!("会话未启动"),
        }
    }

    async fn close(&self) -> PublishResult<()> {
        match &self.behavior {
            Behavior::CloseFails => return Err(PublishError::automation("浏览器进程无响应")),
            Behavior::CloseHangs => std::future::pending::<()>().await,
            _ => {}
        }
        self.closed.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn force_close(&self) {
        self.killed.cancel();
        self.alive.store(false, Ordering::SeqCst);
        *self.force_closed_at.lock().unwrap() = Some(Instant::now());
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// 按脚本依次创建会话，脚本用完后默认成功
#[derive(Default)]
pub struct MockLauncher {
    script: Mutex<VecDeque<Behavior>>,
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
    pub launch_attempts: AtomicU32,
}

impl MockLauncher {
    pub fn scripted(behaviors: Vec<Behavior>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(behaviors.into()),
            sessions: Mutex::new(Vec::new()),
            launch_attempts: AtomicU32::new(0),
        })
    }

    pub fn launches(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index])
    }
}

#[async_trait]
impl AutomationLauncher for MockLauncher {
    async fn launch(&self, _task: &PublishingTask) -> PublishResult<Arc<dyn AutomationSession>> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Succeed);
        self.launch_attempts.fetch_add(1, Ordering::SeqCst);
        if matches!(behavior, Behavior::LaunchHangs) {
            std::future::pending::<()>().await;
        }
        let session = Arc::new(MockSession {
            behavior,
            alive: AtomicBool::new(true),
            killed: CancellationToken::new(),
            closed: AtomicBool::new(false),
            force_closed_at: Mutex::new(None),
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

/// 直接返回预设结果的执行器，结果同步写回任务仓储
pub struct MockRunner {
    tasks: Arc<MockTaskRepository>,
    outcomes: Mutex<VecDeque<PublishResult<TaskOutcome>>>,
    delay: Duration,
    pub calls: Mutex<Vec<i64>>,
}

impl MockRunner {
    pub fn new(
        tasks: Arc<MockTaskRepository>,
        outcomes: Vec<PublishResult<TaskOutcome>>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            outcomes: Mutex::new(outcomes.into()),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for MockRunner {
    async fn run_task(&self, task_id: i64, cancel: CancellationToken) -> PublishResult<TaskOutcome> {
        self.calls.lock().unwrap().push(task_id);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    self.tasks.force_status(task_id, TaskStatus::Cancelled);
                    return Ok(TaskOutcome::Cancelled);
                }
            }
        }

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TaskOutcome::Succeeded));
        match &outcome {
            Ok(TaskOutcome::Succeeded) => self.tasks.force_status(task_id, TaskStatus::Success),
            Ok(TaskOutcome::Failed { .. }) => self.tasks.force_status(task_id, TaskStatus::Failed),
            Ok(TaskOutcome::TimedOut { .. }) => {
                self.tasks.force_status(task_id, TaskStatus::Timeout)
            }
            Ok(TaskOutcome::Cancelled) => self.tasks.force_status(task_id, TaskStatus::Cancelled),
            _ => {}
        }
        outcome
    }
}
