//! 领域事件
//!
//! 推送给用户的单向通知，发布方不等待结果

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{QuotaType, TaskStatus};

/// 领域事件基础trait
pub trait DomainEvent: Send + Sync {
    fn event_id(&self) -> Uuid;
    fn event_type(&self) -> &str;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn aggregate_id(&self) -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    TaskStatusChanged {
        task_id: i64,
        batch_id: Option<String>,
        status: TaskStatus,
        error_message: Option<String>,
    },
    QuotaReservationConfirmed {
        reservation_id: String,
        quota_type: QuotaType,
        consumed: i64,
    },
    QuotaReservationReleased {
        reservation_id: String,
        quota_type: QuotaType,
        released: i64,
        reason: Option<String>,
    },
}

impl NotifyEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            NotifyEvent::TaskStatusChanged { .. } => "task_status_changed",
            NotifyEvent::QuotaReservationConfirmed { .. } => "quota_reservation_confirmed",
            NotifyEvent::QuotaReservationReleased { .. } => "quota_reservation_released",
        }
    }
}

/// 发往某个用户的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEvent {
    pub id: Uuid,
    pub user_id: i64,
    pub event: NotifyEvent,
    pub occurred_at: DateTime<Utc>,
}

impl UserEvent {
    pub fn new(user_id: i64, event: NotifyEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            event,
            occurred_at: Utc::now(),
        }
    }
}

impl DomainEvent for UserEvent {
    fn event_id(&self) -> Uuid {
        self.id
    }

    fn event_type(&self) -> &str {
        self.event.event_type()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn aggregate_id(&self) -> String {
        match &self.event {
            NotifyEvent::TaskStatusChanged { task_id, .. } => task_id.to_string(),
            NotifyEvent::QuotaReservationConfirmed { reservation_id, .. }
            | NotifyEvent::QuotaReservationReleased { reservation_id, .. } => {
                reservation_id.clone()
            }
        }
    }
}

/// 通知桥接口，投递失败不影响调用方
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: UserEvent);
}

/// 不投递任何事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish(&self, _event: UserEvent) {}
}
