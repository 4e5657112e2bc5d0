use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 存储配置。`url = "memory"` 表示使用进程内存储
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://jobsched.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
        }
    }
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url == "memory"
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;

        if !self.is_memory() && !self.url.starts_with("sqlite:") {
            return Err(crate::ConfigError::Validation(
                "database.url 必须为 memory 或以 sqlite: 开头".to_string(),
            ));
        }

        ValidationUtils::validate_count(
            self.max_connections as usize,
            "database.max_connections",
            1000,
        )?;
        if self.min_connections > self.max_connections {
            return Err(crate::ConfigError::Validation(
                "database.min_connections 不能大于 max_connections".to_string(),
            ));
        }

        ValidationUtils::validate_seconds(
            self.connection_timeout_seconds,
            "database.connection_timeout_seconds",
            3600,
        )?;
        ValidationUtils::validate_seconds(
            self.idle_timeout_seconds,
            "database.idle_timeout_seconds",
            86400,
        )?;

        Ok(())
    }
}
