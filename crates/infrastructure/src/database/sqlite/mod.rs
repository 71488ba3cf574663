pub mod sqlite_quota_ledger;
pub mod sqlite_task_repository;

pub use sqlite_quota_ledger::SqliteQuotaLedger;
pub use sqlite_task_repository::SqliteTaskRepository;

use chrono::{DateTime, SecondsFormat, Utc};

/// 定宽时间文本（微秒精度，Z 结尾），字典序即时间序
pub(crate) fn db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
