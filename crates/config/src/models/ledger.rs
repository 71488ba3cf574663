use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 配额预留账本配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// 预留有效期（秒），过期后由回收器释放
    pub reservation_ttl_seconds: u64,
    /// 过期预留回收间隔（秒）
    pub reaper_interval_seconds: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_seconds: 600,
            reaper_interval_seconds: 60,
        }
    }
}

impl ConfigValidator for LedgerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range(
            self.reservation_ttl_seconds,
            1,
            86_400,
            "ledger.reservation_ttl_seconds",
        )?;
        ValidationUtils::validate_range(
            self.reaper_interval_seconds,
            1,
            3600,
            "ledger.reaper_interval_seconds",
        )?;
        Ok(())
    }
}

/// 历史任务清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// 终态任务保留天数
    pub task_retention_days: u64,
    /// 清理间隔（秒）
    pub cleanup_interval_seconds: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            task_retention_days: 30,
            cleanup_interval_seconds: 3600,
        }
    }
}

impl ConfigValidator for RetentionConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range(
            self.task_retention_days,
            1,
            3650,
            "retention.task_retention_days",
        )?;
        ValidationUtils::validate_range(
            self.cleanup_interval_seconds,
            60,
            86_400,
            "retention.cleanup_interval_seconds",
        )?;
        Ok(())
    }
}
