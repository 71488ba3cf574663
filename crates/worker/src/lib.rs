//! 本地执行端
//!
//! 通过远程服务预留配额、更新任务状态，并在本地驱动浏览器自动化完成发布。

pub mod automation;
pub mod backoff;
pub mod batch_scheduler;
pub mod process_launcher;
pub mod remote_client;
pub mod sandbox;

pub use automation::{AutomationLauncher, AutomationSession};
pub use backoff::{BackoffPolicy, BackoffQuotaLedger, BackoffTaskRepository};
pub use batch_scheduler::{BatchRunSummary, BatchScheduler};
pub use process_launcher::{ProcessLauncher, ProcessSession};
pub use remote_client::RemoteClient;
pub use sandbox::{ExecutionSandbox, TaskOutcome, TaskRunner};
