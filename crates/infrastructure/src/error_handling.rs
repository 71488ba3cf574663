//! 仓储层数据库错误处理
//!
//! 统一记录失败的操作与实体，再转换为 `PublishError`

use std::fmt;

use publisher_errors::{PublishError, PublishResult};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Delete,
    Query,
    BatchUpdate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "查询"),
            RepositoryOperation::BatchUpdate => write!(f, "批量更新"),
        }
    }
}

/// 为 sqlx 结果附加操作上下文
pub trait RepositoryResultExt<T> {
    fn with_operation(self, operation: RepositoryOperation, entity: &str) -> PublishResult<T>;
}

impl<T> RepositoryResultExt<T> for Result<T, sqlx::Error> {
    fn with_operation(self, operation: RepositoryOperation, entity: &str) -> PublishResult<T> {
        self.map_err(|e| {
            error!(operation = %operation, entity = entity, "{}{}失败: {}", operation, entity, e);
            PublishError::Database(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_display() {
        assert_eq!(RepositoryOperation::Create.to_string(), "创建");
        assert_eq!(RepositoryOperation::BatchUpdate.to_string(), "批量更新");
    }

    #[test]
    fn test_with_operation_maps_to_database_error() {
        let result: Result<(), sqlx::Error> = Err(sqlx::Error::RowNotFound);
        let err = result
            .with_operation(RepositoryOperation::Read, "任务 (ID: 1)")
            .unwrap_err();
        assert!(matches!(err, PublishError::Database(_)));
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
