//! 以外部进程承载浏览器自动化
//!
//! 任务 JSON 写入子进程标准输入，退出码 0 视为发布成功，标准输出最后一行作为发布结果。
//! 子进程在独立进程组中运行，强制关闭时连同它拉起的浏览器等后代进程一起终止。

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use publisher_config::AgentConfig;
use publisher_domain::PublishingTask;
use publisher_errors::{PublishError, PublishResult};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::automation::{AutomationLauncher, AutomationSession};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        config
            .automation_command
            .as_ref()
            .map(|program| Self::new(program.clone(), config.automation_args.clone()))
    }
}

#[async_trait]
impl AutomationLauncher for ProcessLauncher {
    async fn launch(&self, task: &PublishingTask) -> PublishResult<Arc<dyn AutomationSession>> {
        let payload = serde_json::to_vec(task)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("PUBLISHER_TASK_ID", task.id.to_string())
            .env("PUBLISHER_PLATFORM_ID", &task.platform_id)
            .env("PUBLISHER_ACCOUNT_ID", task.account_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| PublishError::automation(format!("启动自动化进程失败: {e}")))?;
        info!(
            "任务 {} 启动自动化进程: {} (pid={:?})",
            task.id,
            self.program,
            child.id()
        );

        if let Some(mut stdin) = child.stdin.take() {
            let task_id = task.id;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("任务 {} 写入自动化进程输入失败: {}", task_id, e);
                }
            });
        }

        let stdout = child.stdout.take().map(collect_lines);
        let stderr = child.stderr.take().map(collect_lines);

        Ok(Arc::new(ProcessSession {
            task_id: task.id,
            pgid: child.id(),
            child: Mutex::new(Some(child)),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            killed: CancellationToken::new(),
            alive: AtomicBool::new(true),
        }))
    }
}

fn collect_lines<R>(reader: R) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            lines.push(line);
        }
        lines
    })
}

pub struct ProcessSession {
    task_id: i64,
    /// 进程组号，即子进程 pid
    pgid: Option<u32>,
    child: Mutex<Option<Child>>,
    stdout: Mutex<Option<JoinHandle<Vec<String>>>>,
    stderr: Mutex<Option<JoinHandle<Vec<String>>>>,
    killed: CancellationToken,
    alive: AtomicBool,
}

impl ProcessSession {
    async fn take_output(slot: &Mutex<Option<JoinHandle<Vec<String>>>>) -> Vec<String> {
        match slot.lock().await.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// 终止整个进程组并回收子进程
    async fn terminate(&self) -> std::io::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        let child = self.child.lock().await.take();
        self.kill_group();
        let Some(mut child) = child else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            child.start_kill()?;
        }
        child.wait().await.map(|_| ())
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("任务 {} 终止进程组 {} 失败: {}", self.task_id, pgid, e),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}

    async fn poll_exit(&self) -> PublishResult<Option<ExitStatus>> {
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or_else(|| PublishError::automation("自动化进程已被强制终止"))?;
        child
            .try_wait()
            .map_err(|e| PublishError::automation(format!("等待自动化进程失败: {e}")))
    }
}

#[async_trait]
impl AutomationSession for ProcessSession {
    async fn login(&self) -> PublishResult<()> {
        // 登录由自动化程序自行完成
        if self.is_alive() {
            Ok(())
        } else {
            Err(PublishError::automation("自动化进程未在运行"))
        }
    }

    async fn publish(&self, cancel: &CancellationToken) -> PublishResult<serde_json::Value> {
        let status = loop {
            if let Some(status) = self.poll_exit().await? {
                break status;
            }
            tokio::select! {
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    if let Err(e) = self.terminate().await {
                        warn!("任务 {} 取消时终止自动化进程失败: {}", self.task_id, e);
                    }
                    return Err(PublishError::Cancelled("发布过程中任务被取消".to_string()));
                }
                _ = self.killed.cancelled() => {
                    return Err(PublishError::automation("自动化进程已被强制终止"));
                }
            }
        };

        self.alive.store(false, Ordering::SeqCst);
        // 残留的后代进程会占住输出管道
        self.kill_group();
        let stdout = Self::take_output(&self.stdout).await;
        let stderr = Self::take_output(&self.stderr).await;

        if !status.success() {
            let detail = stderr
                .iter()
                .rev()
                .find(|line| !line.trim().is_empty())
                .cloned()
                .unwrap_or_default();
            return Err(PublishError::automation(format!(
                "自动化进程退出码 {:?}: {}",
                status.code(),
                detail
            )));
        }

        let last_line = stdout.iter().rev().find(|line| !line.trim().is_empty());
        Ok(match last_line {
            Some(line) => {
                serde_json::from_str(line).unwrap_or_else(|_| json!({ "output": stdout.join("\n") }))
            }
            None => json!({}),
        })
    }

    async fn close(&self) -> PublishResult<()> {
        self.terminate()
            .await
            .map_err(|e| PublishError::automation(format!("关闭自动化进程失败: {e}")))
    }

    async fn force_close(&self) {
        self.killed.cancel();
        if let Err(e) = self.terminate().await {
            warn!("任务 {} 强制终止自动化进程失败: {}", self.task_id, e);
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
