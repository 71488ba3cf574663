pub mod entities;
pub mod events;
pub mod repositories;

// SQLx 实现（仅在启用 sqlx-support feature 时编译）
#[cfg(feature = "sqlx-support")]
pub mod sqlx_impls;

pub use entities::*;
pub use events::*;
pub use publisher_errors::{PublishError, PublishResult};
pub use repositories::*;
