use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use publisher_domain::{
    Article, ArticleSnapshot, BatchInfo, EventPublisher, LogLevel, NewTask, NotifyEvent,
    PublishingTask, StopBatchResult, TaskFilter, TaskLog, TaskRepository, TaskStatus, TaskSummary,
    UserEvent,
};
use publisher_errors::{PublishError, PublishResult};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::db_timestamp;
use crate::error_handling::{RepositoryOperation, RepositoryResultExt};

const SUMMARY_COLUMNS: &str = "id, user_id, article_id, batch_id, batch_order, title, keyword, \
     account_id, platform_id, status, retry_count, max_retries, scheduled_at, interval_minutes, \
     timeout_minutes, started_at, completed_at, error_message, created_at, updated_at";

const TERMINAL_STATUSES: &str = "('success', 'failed', 'cancelled', 'timeout')";

/// 批次停止时对运行中任务写入的原因
pub const BATCH_STOPPED_RUNNING_MESSAGE: &str = "批次已停止，任务被强制终止";
pub const BATCH_STOPPED_PENDING_MESSAGE: &str = "批次已停止";

/// 状态变更需要的任务字段
struct TaskHead {
    user_id: i64,
    article_id: Option<i64>,
    batch_id: Option<String>,
    account_id: i64,
    platform_id: String,
    status: TaskStatus,
}

pub struct SqliteTaskRepository {
    pool: SqlitePool,
    events: Arc<dyn EventPublisher>,
    default_max_retries: i32,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            pool,
            events,
            default_max_retries: 3,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries as i32;
        self
    }

    pub fn with_write_lock(mut self, write_lock: Arc<Mutex<()>>) -> Self {
        self.write_lock = write_lock;
        self
    }

    fn row_to_summary(row: &sqlx::sqlite::SqliteRow) -> PublishResult<TaskSummary> {
        Ok(TaskSummary {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            article_id: row.try_get("article_id")?,
            batch_id: row.try_get("batch_id")?,
            batch_order: row.try_get("batch_order")?,
            title: row.try_get("title")?,
            keyword: row.try_get("keyword")?,
            account_id: row.try_get("account_id")?,
            platform_id: row.try_get("platform_id")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            scheduled_at: row.try_get("scheduled_at")?,
            interval_minutes: row.try_get("interval_minutes")?,
            timeout_minutes: row.try_get("timeout_minutes")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> PublishResult<PublishingTask> {
        Ok(PublishingTask {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            article_id: row.try_get("article_id")?,
            batch_id: row.try_get("batch_id")?,
            batch_order: row.try_get("batch_order")?,
            snapshot: ArticleSnapshot {
                title: row.try_get("title")?,
                content: row.try_get("content")?,
                keyword: row.try_get("keyword")?,
            },
            account_id: row.try_get("account_id")?,
            platform_id: row.try_get("platform_id")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            scheduled_at: row.try_get("scheduled_at")?,
            interval_minutes: row.try_get("interval_minutes")?,
            timeout_minutes: row.try_get("timeout_minutes")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_article(row: &sqlx::sqlite::SqliteRow) -> PublishResult<Article> {
        Ok(Article {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            keyword: row.try_get("keyword")?,
            publishing_status: row.try_get("publishing_status")?,
            is_published: row.try_get("is_published")?,
            published_at: row.try_get("published_at")?,
        })
    }

    async fn fetch_head(conn: &mut SqliteConnection, id: i64) -> PublishResult<TaskHead> {
        let row = sqlx::query(
            "SELECT user_id, article_id, batch_id, account_id, platform_id, status \
             FROM publishing_tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .with_operation(RepositoryOperation::Read, &format!("任务 (ID: {id})"))?
        .ok_or_else(|| PublishError::task_not_found(id))?;

        Ok(TaskHead {
            user_id: row.try_get("user_id")?,
            article_id: row.try_get("article_id")?,
            batch_id: row.try_get("batch_id")?,
            account_id: row.try_get("account_id")?,
            platform_id: row.try_get("platform_id")?,
            status: row.try_get("status")?,
        })
    }

    async fn clear_article_publishing(
        conn: &mut SqliteConnection,
        article_id: Option<i64>,
    ) -> PublishResult<()> {
        if let Some(article_id) = article_id {
            sqlx::query("UPDATE articles SET publishing_status = NULL WHERE id = ?")
                .bind(article_id)
                .execute(&mut *conn)
                .await
                .with_operation(RepositoryOperation::Update, "文章发布状态")?;
        }
        Ok(())
    }

    /// 发布成功：写发布记录与用量记录（每个任务各一条），并标记文章已发布
    async fn record_success(
        conn: &mut SqliteConnection,
        task_id: i64,
        head: &TaskHead,
        now: DateTime<Utc>,
    ) -> PublishResult<()> {
        let now_text = db_timestamp(now);

        sqlx::query(
            "INSERT OR IGNORE INTO publishing_records \
             (task_id, user_id, article_id, account_id, platform_id, published_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(head.user_id)
        .bind(head.article_id)
        .bind(head.account_id)
        .bind(&head.platform_id)
        .bind(&now_text)
        .execute(&mut *conn)
        .await
        .with_operation(RepositoryOperation::Create, "发布记录")?;

        let usage = sqlx::query(
            "INSERT OR IGNORE INTO usage_records \
             (user_id, feature_code, amount, resource_type, resource_id, created_at) \
             VALUES (?, 'publish', 1, 'publishing_task', ?, ?)",
        )
        .bind(head.user_id)
        .bind(task_id)
        .bind(&now_text)
        .execute(&mut *conn)
        .await
        .with_operation(RepositoryOperation::Create, "用量记录")?;

        if usage.rows_affected() == 0 {
            debug!("任务 {} 的用量已记录，跳过", task_id);
        }

        if let Some(article_id) = head.article_id {
            sqlx::query(
                "UPDATE articles SET publishing_status = NULL, is_published = 1, \
                 published_at = COALESCE(published_at, ?) WHERE id = ?",
            )
            .bind(&now_text)
            .bind(article_id)
            .execute(&mut *conn)
            .await
            .with_operation(RepositoryOperation::Update, "文章发布状态")?;
        }
        Ok(())
    }

    fn notify_status(
        &self,
        user_id: i64,
        task_id: i64,
        batch_id: Option<String>,
        status: TaskStatus,
        error_message: Option<&str>,
    ) {
        self.events.publish(UserEvent::new(
            user_id,
            NotifyEvent::TaskStatusChanged {
                task_id,
                batch_id,
                status,
                error_message: error_message.map(str::to_string),
            },
        ));
    }

    pub async fn create_article(
        &self,
        user_id: i64,
        title: &str,
        content: &str,
        keyword: Option<&str>,
    ) -> PublishResult<Article> {
        let id = sqlx::query(
            "INSERT INTO articles (user_id, title, content, keyword, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(title)
        .bind(content)
        .bind(keyword)
        .bind(db_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .with_operation(RepositoryOperation::Create, "文章")?
        .last_insert_rowid();

        self.get_article(id).await
    }

    pub async fn get_article(&self, id: i64) -> PublishResult<Article> {
        let row = sqlx::query(
            "SELECT id, user_id, title, content, keyword, publishing_status, is_published, \
             published_at FROM articles WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_operation(RepositoryOperation::Read, "文章")?
        .ok_or_else(|| PublishError::invalid_params(format!("文章不存在: {id}")))?;

        Self::row_to_article(&row)
    }

    /// 删除完成时间早于保留期的终态任务
    #[instrument(skip(self))]
    pub async fn cleanup_old_tasks(&self, retention: Duration) -> PublishResult<u64> {
        let cutoff = Utc::now() - retention;
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(&format!(
            "DELETE FROM publishing_tasks WHERE status IN {TERMINAL_STATUSES} \
             AND completed_at IS NOT NULL AND completed_at < ?"
        ))
        .bind(db_timestamp(cutoff))
        .execute(&self.pool)
        .await
        .with_operation(RepositoryOperation::Delete, "历史任务")?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!("清理 {} 个早于 {} 的历史任务", removed, cutoff);
        }
        Ok(removed)
    }

    /// 已记录的用量条数，按任务统计
    pub async fn usage_count(&self, task_id: i64) -> PublishResult<i64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM usage_records \
             WHERE resource_type = 'publishing_task' AND resource_id = ?",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .with_operation(RepositoryOperation::Query, "用量记录")?
        .try_get("count")?;
        Ok(count)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(
        user_id = task.user_id,
        batch_id = ?task.batch_id,
        platform = %task.platform_id,
    ))]
    async fn create_task(&self, task: &NewTask) -> PublishResult<TaskSummary> {
        let now = Utc::now();
        task.validate(now)?;
        let max_retries = task.max_retries.unwrap_or(self.default_max_retries);

        let id = {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .with_operation(RepositoryOperation::Create, "任务事务")?;

            if let Some(article_id) = task.article_id {
                let marked = sqlx::query(
                    "UPDATE articles SET publishing_status = 'pending' WHERE id = ?",
                )
                .bind(article_id)
                .execute(&mut *tx)
                .await
                .with_operation(RepositoryOperation::Update, "文章发布状态")?;
                if marked.rows_affected() == 0 {
                    return Err(PublishError::invalid_params(format!(
                        "文章不存在: {article_id}"
                    )));
                }
            }

            let now_text = db_timestamp(now);
            let id = sqlx::query(
                "INSERT INTO publishing_tasks \
                 (user_id, article_id, batch_id, batch_order, title, content, keyword, account_id, \
                  platform_id, status, retry_count, max_retries, scheduled_at, interval_minutes, \
                  timeout_minutes, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?, ?)",
            )
            .bind(task.user_id)
            .bind(task.article_id)
            .bind(&task.batch_id)
            .bind(task.batch_order)
            .bind(&task.snapshot.title)
            .bind(&task.snapshot.content)
            .bind(&task.snapshot.keyword)
            .bind(task.account_id)
            .bind(&task.platform_id)
            .bind(max_retries)
            .bind(task.scheduled_at.map(db_timestamp))
            .bind(task.interval_minutes)
            .bind(task.timeout_minutes)
            .bind(&now_text)
            .bind(&now_text)
            .execute(&mut *tx)
            .await
            .with_operation(RepositoryOperation::Create, "发布任务")?
            .last_insert_rowid();

            tx.commit()
                .await
                .with_operation(RepositoryOperation::Create, "任务事务")?;
            id
        };

        debug!("创建发布任务 {}", id);
        self.get_task(id).await
    }

    #[instrument(skip(self))]
    async fn get_task(&self, id: i64) -> PublishResult<TaskSummary> {
        let row = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM publishing_tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_operation(RepositoryOperation::Read, &format!("任务 (ID: {id})"))?
        .ok_or_else(|| PublishError::task_not_found(id))?;

        Self::row_to_summary(&row)
    }

    #[instrument(skip(self))]
    async fn get_task_for_execution(&self, id: i64) -> PublishResult<PublishingTask> {
        let row = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS}, content FROM publishing_tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_operation(RepositoryOperation::Read, &format!("任务 (ID: {id})"))?
        .ok_or_else(|| PublishError::task_not_found(id))?;

        Self::row_to_task(&row)
    }

    #[instrument(skip(self, filter))]
    async fn list_tasks(&self, filter: &TaskFilter) -> PublishResult<Vec<TaskSummary>> {
        let status = filter.status.map(|s| s.as_str());
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        let offset = filter.offset.unwrap_or(0).max(0);

        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM publishing_tasks \
             WHERE (? IS NULL OR user_id = ?) \
               AND (? IS NULL OR status = ?) \
               AND (? IS NULL OR batch_id = ?) \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(filter.user_id)
        .bind(filter.user_id)
        .bind(status)
        .bind(status)
        .bind(&filter.batch_id)
        .bind(&filter.batch_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .with_operation(RepositoryOperation::Query, "任务列表")?;

        rows.iter().map(Self::row_to_summary).collect()
    }

    #[instrument(skip(self))]
    async fn list_by_batch(&self, batch_id: &str) -> PublishResult<Vec<TaskSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM publishing_tasks WHERE batch_id = ? \
             ORDER BY batch_order ASC, id ASC"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .with_operation(RepositoryOperation::Query, &format!("批次 {batch_id}"))?;

        rows.iter().map(Self::row_to_summary).collect()
    }

    #[instrument(skip(self, error_message))]
    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> PublishResult<()> {
        let head = {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .with_operation(RepositoryOperation::Update, "状态事务")?;

            let head = Self::fetch_head(&mut tx, id).await?;
            if !head.status.can_transition_to(status) {
                return Err(PublishError::InvalidStateTransition {
                    id,
                    from: head.status.to_string(),
                    to: status.to_string(),
                });
            }
            if head.status == status && status.is_terminal() {
                debug!("任务 {} 已处于 {}，忽略重复更新", id, status);
                return Ok(());
            }

            let now = Utc::now();
            let now_text = db_timestamp(now);
            let query = match status {
                TaskStatus::Pending => sqlx::query(
                    "UPDATE publishing_tasks SET status = ?, error_message = ?, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(error_message)
                .bind(&now_text)
                .bind(id),
                TaskStatus::Running => sqlx::query(
                    "UPDATE publishing_tasks SET status = ?, error_message = ?, started_at = ?, \
                     updated_at = ? WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(error_message)
                .bind(&now_text)
                .bind(&now_text)
                .bind(id),
                _ => sqlx::query(
                    "UPDATE publishing_tasks SET status = ?, error_message = ?, completed_at = ?, \
                     updated_at = ? WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(error_message)
                .bind(&now_text)
                .bind(&now_text)
                .bind(id),
            };
            query
                .execute(&mut *tx)
                .await
                .with_operation(RepositoryOperation::Update, &format!("任务 (ID: {id})"))?;

            if status == TaskStatus::Success {
                Self::record_success(&mut tx, id, &head, now).await?;
            } else if status.is_terminal() {
                Self::clear_article_publishing(&mut tx, head.article_id).await?;
            }

            tx.commit()
                .await
                .with_operation(RepositoryOperation::Update, "状态事务")?;
            head
        };

        info!("任务 {} 状态 {} -> {}", id, head.status, status);
        self.notify_status(head.user_id, id, head.batch_id, status, error_message);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn increment_retry_count(&self, id: i64) -> PublishResult<i32> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .with_operation(RepositoryOperation::Update, "重试计数事务")?;

        let updated = sqlx::query(
            "UPDATE publishing_tasks SET retry_count = MIN(retry_count + 1, max_retries), \
             updated_at = ? WHERE id = ?",
        )
        .bind(db_timestamp(Utc::now()))
        .bind(id)
        .execute(&mut *tx)
        .await
        .with_operation(RepositoryOperation::Update, &format!("任务 (ID: {id})"))?;
        if updated.rows_affected() == 0 {
            return Err(PublishError::task_not_found(id));
        }

        let retry_count: i32 = sqlx::query("SELECT retry_count FROM publishing_tasks WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .with_operation(RepositoryOperation::Read, &format!("任务 (ID: {id})"))?
            .try_get("retry_count")?;

        tx.commit()
            .await
            .with_operation(RepositoryOperation::Update, "重试计数事务")?;
        debug!("任务 {} 重试次数 {}", id, retry_count);
        Ok(retry_count)
    }

    async fn cancel_task(&self, id: i64) -> PublishResult<()> {
        self.update_status(id, TaskStatus::Cancelled, Some("任务已取消"))
            .await
    }

    #[instrument(skip(self))]
    async fn delete_task(&self, id: i64) -> PublishResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .with_operation(RepositoryOperation::Delete, "删除事务")?;

        let head = Self::fetch_head(&mut tx, id).await?;
        if head.status == TaskStatus::Running {
            return Err(PublishError::InvalidStateTransition {
                id,
                from: head.status.to_string(),
                to: "deleted".to_string(),
            });
        }
        if head.status == TaskStatus::Pending {
            Self::clear_article_publishing(&mut tx, head.article_id).await?;
        }

        sqlx::query("DELETE FROM publishing_tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .with_operation(RepositoryOperation::Delete, &format!("任务 (ID: {id})"))?;

        tx.commit()
            .await
            .with_operation(RepositoryOperation::Delete, "删除事务")?;
        info!("删除任务 {}", id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_batch(&self, batch_id: &str) -> PublishResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .with_operation(RepositoryOperation::Delete, "删除事务")?;

        sqlx::query(
            "UPDATE articles SET publishing_status = NULL WHERE id IN (\
             SELECT article_id FROM publishing_tasks \
             WHERE batch_id = ? AND status = 'pending' AND article_id IS NOT NULL)",
        )
        .bind(batch_id)
        .execute(&mut *tx)
        .await
        .with_operation(RepositoryOperation::BatchUpdate, "文章发布状态")?;

        let deleted = sqlx::query(
            "DELETE FROM publishing_tasks WHERE batch_id = ? AND status != 'running'",
        )
        .bind(batch_id)
        .execute(&mut *tx)
        .await
        .with_operation(RepositoryOperation::Delete, &format!("批次 {batch_id}"))?
        .rows_affected();

        tx.commit()
            .await
            .with_operation(RepositoryOperation::Delete, "删除事务")?;
        info!("删除批次 {} 的 {} 个任务", batch_id, deleted);
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn batch_info(&self, batch_id: &str) -> PublishResult<BatchInfo> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_tasks, \
             COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending_tasks, \
             COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0) AS running_tasks, \
             COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) AS success_tasks, \
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_tasks, \
             COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0) AS cancelled_tasks, \
             COALESCE(SUM(CASE WHEN status = 'timeout' THEN 1 ELSE 0 END), 0) AS timeout_tasks \
             FROM publishing_tasks WHERE batch_id = ?",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await
        .with_operation(RepositoryOperation::Query, &format!("批次 {batch_id}"))?;

        Ok(BatchInfo {
            batch_id: batch_id.to_string(),
            total_tasks: row.try_get("total_tasks")?,
            pending_tasks: row.try_get("pending_tasks")?,
            running_tasks: row.try_get("running_tasks")?,
            success_tasks: row.try_get("success_tasks")?,
            failed_tasks: row.try_get("failed_tasks")?,
            cancelled_tasks: row.try_get("cancelled_tasks")?,
            timeout_tasks: row.try_get("timeout_tasks")?,
        })
    }

    #[instrument(skip(self))]
    async fn stop_batch(&self, batch_id: &str) -> PublishResult<StopBatchResult> {
        let (stopped, result) = {
            let _guard = self.write_lock.lock().await;
            let mut tx = self
                .pool
                .begin()
                .await
                .with_operation(RepositoryOperation::BatchUpdate, "停止批次事务")?;

            let rows = sqlx::query(
                "SELECT id, user_id, article_id, status FROM publishing_tasks \
                 WHERE batch_id = ? AND status IN ('pending', 'running')",
            )
            .bind(batch_id)
            .fetch_all(&mut *tx)
            .await
            .with_operation(RepositoryOperation::Query, &format!("批次 {batch_id}"))?;

            let now_text = db_timestamp(Utc::now());
            let mut stopped = Vec::with_capacity(rows.len());
            let mut result = StopBatchResult::default();

            for row in &rows {
                let id: i64 = row.try_get("id")?;
                let user_id: i64 = row.try_get("user_id")?;
                let article_id: Option<i64> = row.try_get("article_id")?;
                let status: TaskStatus = row.try_get("status")?;

                let message = if status == TaskStatus::Running {
                    result.terminated_count += 1;
                    BATCH_STOPPED_RUNNING_MESSAGE
                } else {
                    result.cancelled_count += 1;
                    BATCH_STOPPED_PENDING_MESSAGE
                };

                sqlx::query(
                    "UPDATE publishing_tasks SET status = 'cancelled', error_message = ?, \
                     completed_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(message)
                .bind(&now_text)
                .bind(&now_text)
                .bind(id)
                .execute(&mut *tx)
                .await
                .with_operation(RepositoryOperation::Update, &format!("任务 (ID: {id})"))?;
                Self::clear_article_publishing(&mut tx, article_id).await?;

                stopped.push((id, user_id, message));
            }

            tx.commit()
                .await
                .with_operation(RepositoryOperation::BatchUpdate, "停止批次事务")?;
            (stopped, result)
        };

        for (id, user_id, message) in stopped {
            self.notify_status(
                user_id,
                id,
                Some(batch_id.to_string()),
                TaskStatus::Cancelled,
                Some(message),
            );
        }

        if result.terminated_count > 0 {
            warn!(
                "批次 {} 停止: 取消 {} 个待执行任务，强制终止 {} 个运行中任务",
                batch_id, result.cancelled_count, result.terminated_count
            );
        } else {
            info!("批次 {} 停止: 取消 {} 个待执行任务", batch_id, result.cancelled_count);
        }
        Ok(result)
    }

    #[instrument(skip(self, message, details))]
    async fn add_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> PublishResult<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM publishing_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .with_operation(RepositoryOperation::Read, &format!("任务 (ID: {task_id})"))?;
        if exists.is_none() {
            return Err(PublishError::task_not_found(task_id));
        }

        sqlx::query(
            "INSERT INTO publishing_logs (task_id, level, message, details, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(level.as_str())
        .bind(message)
        .bind(details.map(|d| d.to_string()))
        .bind(db_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .with_operation(RepositoryOperation::Create, "任务日志")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_logs(&self, task_id: i64) -> PublishResult<Vec<TaskLog>> {
        let rows = sqlx::query(
            "SELECT id, task_id, level, message, details, created_at FROM publishing_logs \
             WHERE task_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .with_operation(RepositoryOperation::Query, "任务日志")?;

        rows.iter()
            .map(|row| -> PublishResult<TaskLog> {
                let level: String = row.try_get("level")?;
                let details: Option<String> = row.try_get("details")?;
                Ok(TaskLog {
                    id: row.try_get("id")?,
                    task_id: row.try_get("task_id")?,
                    level: level.parse()?,
                    message: row.try_get("message")?,
                    details: details.map(|d| serde_json::from_str(&d)).transpose()?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
