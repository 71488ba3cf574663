use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_address: String,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
        }
    }
}

impl ConfigValidator for ApiConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.bind_address, "api.bind_address")?;
        if !self.bind_address.contains(':') {
            return Err(crate::ConfigError::Validation(
                "api.bind_address must be in host:port form".to_string(),
            ));
        }
        Ok(())
    }
}

/// 本地执行端连接远程服务的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_url: String,
    /// 预留记录上标识客户端，缺省使用主机名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub request_timeout_seconds: u64,
    /// 执行发布的自动化程序，任务以 JSON 写入其标准输入
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation_command: Option<String>,
    #[serde(default)]
    pub automation_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            client_id: None,
            request_timeout_seconds: 30,
            automation_command: None,
            automation_args: Vec::new(),
        }
    }
}

impl ConfigValidator for AgentConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_url(&self.server_url, "agent.server_url")?;
        ValidationUtils::validate_range(
            self.request_timeout_seconds,
            1,
            600,
            "agent.request_timeout_seconds",
        )?;
        if let Some(command) = &self.automation_command {
            ValidationUtils::validate_not_empty(command, "agent.automation_command")?;
        }
        Ok(())
    }
}
