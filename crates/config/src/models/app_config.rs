use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_agent::{AgentConfig, ApiConfig},
    database::DatabaseConfig,
    execution::{BackoffSettings, BatchConfig, ExecutionConfig},
    ledger::{LedgerConfig, RetentionConfig},
    logging::ObservabilityConfig,
};
use crate::validation::ConfigValidator;

/// 兼容旧部署的环境变量，优先级高于配置文件
const LEGACY_OVERRIDES: [(&str, &str); 2] = [
    ("TASK_TIMEOUT_MINUTES", "execution.task_timeout_minutes"),
    ("TASK_MAX_RETRIES", "execution.max_retries"),
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub retention: RetentionConfig,
    pub execution: ExecutionConfig,
    pub batch: BatchConfig,
    pub backoff: BackoffSettings,
    pub api: ApiConfig,
    pub agent: AgentConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    fn load_with<F>(config_path: Option<&str>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("生成默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/publisher.toml", "publisher.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("PUBLISHER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in LEGACY_OVERRIDES {
            let value = match lookup(var) {
                Some(raw) => Some(
                    raw.trim()
                        .parse::<i64>()
                        .with_context(|| format!("环境变量 {var} 不是有效整数: {raw}"))?,
                ),
                None => None,
            };
            builder = builder.set_override_option(key, value)?;
        }

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.database.validate()?;
        self.ledger.validate()?;
        self.retention.validate()?;
        self.execution.validate()?;
        self.batch.validate()?;
        self.backoff.validate()?;
        self.api.validate()?;
        self.agent.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
