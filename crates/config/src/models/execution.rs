use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 单任务执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// 默认执行截止时间（分钟），最少 1 分钟
    pub task_timeout_minutes: u64,
    /// 默认最大重试次数
    pub max_retries: u32,
    /// 优雅关闭浏览器的等待时间（秒），超时后强制关闭
    pub close_timeout_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            task_timeout_minutes: 15,
            max_retries: 3,
            close_timeout_seconds: 10,
        }
    }
}

impl ConfigValidator for ExecutionConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range(
            self.task_timeout_minutes,
            1,
            1440,
            "execution.task_timeout_minutes",
        )?;
        ValidationUtils::validate_range(self.max_retries as u64, 0, 100, "execution.max_retries")?;
        ValidationUtils::validate_range(
            self.close_timeout_seconds,
            1,
            300,
            "execution.close_timeout_seconds",
        )?;
        Ok(())
    }
}

/// 批次调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// 本地停止标志轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 向服务端复查剩余待执行任务的间隔（秒）
    pub server_recheck_seconds: u64,
    /// 任务失败后重新执行同一任务前的等待（秒）
    pub retry_interval_seconds: u64,
    /// 任务间隔之外追加的缓冲时间（秒）
    pub interval_buffer_seconds: u64,
    /// 限流未给出 retryAfter 时的默认等待（秒）
    pub rate_limit_wait_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            server_recheck_seconds: 30,
            retry_interval_seconds: 60,
            interval_buffer_seconds: 5,
            rate_limit_wait_seconds: 60,
        }
    }
}

impl ConfigValidator for BatchConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range(self.poll_interval_ms, 10, 60_000, "batch.poll_interval_ms")?;
        ValidationUtils::validate_range(
            self.server_recheck_seconds,
            1,
            3600,
            "batch.server_recheck_seconds",
        )?;
        ValidationUtils::validate_range(
            self.retry_interval_seconds,
            0,
            3600,
            "batch.retry_interval_seconds",
        )?;
        ValidationUtils::validate_range(
            self.rate_limit_wait_seconds,
            1,
            3600,
            "batch.rate_limit_wait_seconds",
        )?;
        Ok(())
    }
}

/// 限流退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    /// 随机抖动比例（0.0-1.0）
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_seconds: 30,
            max_delay_seconds: 600,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

impl ConfigValidator for BackoffSettings {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range(self.base_delay_seconds, 1, 3600, "backoff.base_delay_seconds")?;
        if self.max_delay_seconds < self.base_delay_seconds {
            return Err(crate::ConfigError::Validation(
                "backoff.max_delay_seconds must be greater than or equal to base_delay_seconds"
                    .to_string(),
            ));
        }
        ValidationUtils::validate_ratio(self.jitter_factor, "backoff.jitter_factor")?;
        ValidationUtils::validate_count(self.max_attempts as usize, "backoff.max_attempts")?;
        Ok(())
    }
}
