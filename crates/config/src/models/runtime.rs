use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// CRON 触发源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 10,
        }
    }
}

impl ConfigValidator for TriggerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(
            self.poll_interval_seconds,
            "trigger.poll_interval_seconds",
            3600,
        )
    }
}

/// 数据保留与过期锁清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub sweep_interval_seconds: u64,
    pub execution_retention_days: u32,
    pub lock_sweep_enabled: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_seconds: 3600,
            execution_retention_days: 30,
            lock_sweep_enabled: true,
        }
    }
}

impl ConfigValidator for RetentionConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(
            self.sweep_interval_seconds,
            "retention.sweep_interval_seconds",
            7 * 86400,
        )?;
        ValidationUtils::validate_count(
            self.execution_retention_days as usize,
            "retention.execution_retention_days",
            3650,
        )
    }
}
