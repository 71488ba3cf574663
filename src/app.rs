use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use publisher_api::{create_app, AppState};
use publisher_config::AppConfig;
use publisher_infrastructure::{BroadcastEventBus, DatabaseManager, ReaperService};
use publisher_worker::{
    BackoffPolicy, BackoffQuotaLedger, BackoffTaskRepository, BatchScheduler, ExecutionSandbox,
    ProcessLauncher, RemoteClient,
};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 配额账本与任务服务
    Server,
    /// 本地执行端
    Agent,
    /// 同一进程内同时运行
    All,
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(AppMode::Server),
            "agent" => Ok(AppMode::Agent),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
    batches: Vec<String>,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode, batches: Vec<String>) -> Result<Self> {
        if mode == AppMode::Server && !batches.is_empty() {
            return Err(anyhow::anyhow!("--batch 只能在 agent 或 all 模式下使用"));
        }
        if mode != AppMode::Server && config.agent.automation_command.is_none() {
            return Err(anyhow::anyhow!(
                "执行端需要配置 agent.automation_command（或环境变量 PUBLISHER_AGENT__AUTOMATION_COMMAND）"
            ));
        }
        Ok(Self {
            config,
            mode,
            batches,
        })
    }

    /// 运行直到收到关闭信号；执行端模式下所有批次结束后也会返回
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Server => {
                let server = self.start_server(shutdown_rx).await?;
                server.await.context("服务端任务异常退出")?;
            }
            AppMode::Agent => {
                self.run_agent(shutdown_rx).await?;
            }
            AppMode::All => {
                let server = self.start_server(shutdown_rx.resubscribe()).await?;
                self.run_agent(shutdown_rx).await?;
                info!("批次执行完毕，服务端继续运行直到收到关闭信号");
                server.await.context("服务端任务异常退出")?;
            }
        }

        Ok(())
    }

    /// 初始化数据库并开始监听，返回时端口已绑定
    async fn start_server(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<JoinHandle<()>> {
        ensure_database_dir(&self.config.database.url).await?;
        let manager = DatabaseManager::new(&self.config.database)
            .await
            .context("初始化数据库失败")?;

        let events = Arc::new(BroadcastEventBus::default());
        let ledger = Arc::new(
            manager
                .quota_ledger(events.clone())
                .with_reservation_ttl(Duration::from_secs(
                    self.config.ledger.reservation_ttl_seconds,
                )),
        );
        let tasks = Arc::new(
            manager
                .task_repository(events.clone())
                .with_default_max_retries(self.config.execution.max_retries),
        );

        let mut reaper = ReaperService::new(
            ledger.clone(),
            tasks.clone(),
            self.config.ledger.clone(),
            self.config.retention.clone(),
        );
        reaper.start();

        let app = create_app(AppState::new(ledger, tasks, events), &self.config.api);
        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
        info!("API服务器启动在 http://{}", self.config.api.bind_address);

        Ok(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
                info!("API服务器收到关闭信号");
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("API服务器运行失败: {}", e);
            }

            reaper.stop().await;
            manager.close().await;
            info!("服务端已停止");
        }))
    }

    async fn run_agent(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let remote = Arc::new(RemoteClient::from_config(&self.config.agent)?);
        info!(
            "启动执行端 {}，远程服务: {}",
            remote.client_id(),
            remote.base_url()
        );

        let policy = BackoffPolicy::from(&self.config.backoff);
        let tasks = Arc::new(BackoffTaskRepository::new(remote.clone(), policy.clone()));
        let ledger = Arc::new(BackoffQuotaLedger::new(remote.clone(), policy));
        let launcher = ProcessLauncher::from_config(&self.config.agent)
            .context("未配置 agent.automation_command")?;

        let sandbox = ExecutionSandbox::new(
            tasks.clone(),
            ledger,
            Arc::new(launcher),
            self.config.execution.clone(),
        )
        .with_client_id(remote.client_id());
        let scheduler = BatchScheduler::new(tasks, Arc::new(sandbox), self.config.batch.clone());

        if self.batches.is_empty() {
            warn!("未指定要执行的批次，执行端空闲等待关闭信号");
            let _ = shutdown_rx.recv().await;
            return Ok(());
        }

        let runs = futures::future::join_all(self.batches.iter().map(|batch_id| {
            let scheduler = scheduler.clone();
            async move { scheduler.execute_batch(batch_id).await }
        }));
        tokio::pin!(runs);

        let summaries = tokio::select! {
            summaries = &mut runs => summaries,
            _ = shutdown_rx.recv() => {
                info!("执行端收到关闭信号，停止本地批次循环");
                scheduler.shutdown().await;
                runs.await
            }
        };

        for summary in summaries {
            match &summary.error {
                Some(e) => error!("批次 {} 异常结束: {}", summary.batch_id, e),
                None => info!(
                    "批次 {} 完成: 共 {} 个任务，成功 {}，失败 {}，超时 {}，取消 {}，跳过 {}",
                    summary.batch_id,
                    summary.total_tasks,
                    summary.succeeded,
                    summary.failed,
                    summary.timed_out,
                    summary.cancelled,
                    summary.skipped
                ),
            }
        }
        Ok(())
    }
}

/// 文件数据库所在目录不存在时创建
async fn ensure_database_dir(url: &str) -> Result<()> {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建数据库目录失败: {}", parent.display()))?;
        }
    }
    Ok(())
}
