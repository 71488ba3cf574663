use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use publisher_config::{LedgerConfig, RetentionConfig};
use publisher_errors::PublishResult;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::database::{SqliteQuotaLedger, SqliteTaskRepository};

/// 单次回收结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaperStats {
    pub expired_reservations: u64,
    pub cleaned_tasks: u64,
}

/// 后台回收服务
///
/// 定期把过期预留标记为 expired，并按保留期清理历史任务
pub struct ReaperService {
    ledger: Arc<SqliteQuotaLedger>,
    tasks: Arc<SqliteTaskRepository>,
    ledger_config: LedgerConfig,
    retention: RetentionConfig,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ReaperService {
    pub fn new(
        ledger: Arc<SqliteQuotaLedger>,
        tasks: Arc<SqliteTaskRepository>,
        ledger_config: LedgerConfig,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            ledger,
            tasks,
            ledger_config,
            retention,
            shutdown_tx: None,
            handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("回收服务已在运行");
            return;
        }

        info!(
            "启动回收服务: 预留回收间隔 {}s，任务清理{}",
            self.ledger_config.reaper_interval_seconds,
            if self.retention.enabled { "已启用" } else { "已禁用" }
        );

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let ledger = self.ledger.clone();
        let tasks = self.tasks.clone();
        let retention = self.retention.clone();
        let reaper_period = Duration::from_secs(self.ledger_config.reaper_interval_seconds);
        let cleanup_period = Duration::from_secs(self.retention.cleanup_interval_seconds);

        let handle = tokio::spawn(async move {
            let mut reaper_interval = interval(reaper_period);
            let mut cleanup_interval = interval(cleanup_period);

            loop {
                tokio::select! {
                    _ = reaper_interval.tick() => {
                        if let Err(e) = ledger.expire_overdue(Utc::now()).await {
                            error!("回收过期预留失败: {}", e);
                        }
                    }
                    _ = cleanup_interval.tick(), if retention.enabled => {
                        if let Err(e) = Self::cleanup_tasks(&tasks, &retention).await {
                            error!("清理历史任务失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("收到回收服务停止请求");
                        break;
                    }
                }
            }
        });

        self.handle = Some(handle);
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("等待回收服务停止时出错: {}", e);
            }
        }

        info!("回收服务已停止");
    }

    /// 立即执行一轮回收
    pub async fn run_once(&self) -> PublishResult<ReaperStats> {
        let expired_reservations = self.ledger.expire_overdue(Utc::now()).await?;
        let cleaned_tasks = if self.retention.enabled {
            Self::cleanup_tasks(&self.tasks, &self.retention).await?
        } else {
            0
        };

        Ok(ReaperStats {
            expired_reservations,
            cleaned_tasks,
        })
    }

    async fn cleanup_tasks(
        tasks: &SqliteTaskRepository,
        retention: &RetentionConfig,
    ) -> PublishResult<u64> {
        tasks
            .cleanup_old_tasks(chrono::Duration::days(retention.task_retention_days as i64))
            .await
    }
}
