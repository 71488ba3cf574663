//! 进程内通知桥
//!
//! 基于 tokio broadcast，订阅方按用户过滤；慢订阅者丢弃最旧的事件

use publisher_domain::{EventPublisher, UserEvent};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub struct BroadcastEventBus {
    sender: broadcast::Sender<UserEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe_user(&self, user_id: i64) -> UserSubscription {
        UserSubscription {
            user_id,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastEventBus {
    fn publish(&self, event: UserEvent) {
        let event_type = event.event.event_type();
        let user_id = event.user_id;
        if self.sender.send(event).is_err() {
            debug!("没有订阅者，丢弃事件 {} (用户 {})", event_type, user_id);
        }
    }
}

/// 单个用户的事件流
pub struct UserSubscription {
    user_id: i64,
    receiver: broadcast::Receiver<UserEvent>,
}

impl UserSubscription {
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// 下一条属于该用户的事件；通道关闭时返回 None
    pub async fn recv(&mut self) -> Option<UserEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.user_id == self.user_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("用户 {} 的事件订阅落后，丢弃 {} 条", self.user_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
