//! 浏览器自动化接口
//!
//! 具体的页面操作由外部实现，这里只约定执行控制器需要的生命周期

use std::sync::Arc;

use async_trait::async_trait;
use publisher_domain::PublishingTask;
use publisher_errors::PublishResult;
use tokio_util::sync::CancellationToken;

/// 一次发布尝试占用的自动化资源（浏览器、页面或子进程）
#[async_trait]
pub trait AutomationSession: Send + Sync {
    async fn login(&self) -> PublishResult<()>;

    /// 发布文章，步骤之间需要检查 `cancel`
    async fn publish(&self, cancel: &CancellationToken) -> PublishResult<serde_json::Value>;

    /// 优雅关闭
    async fn close(&self) -> PublishResult<()>;

    /// 立即终止底层资源，不允许失败
    async fn force_close(&self);

    fn is_alive(&self) -> bool;
}

#[async_trait]
pub trait AutomationLauncher: Send + Sync {
    async fn launch(&self, task: &PublishingTask) -> PublishResult<Arc<dyn AutomationSession>>;
}
