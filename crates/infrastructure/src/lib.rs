pub mod cleanup_service;
pub mod database;
pub mod error_handling;
pub mod event_bus;

pub use cleanup_service::{ReaperService, ReaperStats};
pub use database::*;
pub use event_bus::{BroadcastEventBus, UserSubscription};
