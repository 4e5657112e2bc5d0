use crate::{ConfigError, ConfigResult};

/// 配置校验
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{field_name} 不能为空")));
        }
        Ok(())
    }

    /// 秒级配置必须在 (0, max] 范围内
    pub fn validate_seconds(value: u64, field_name: &str, max: u64) -> ConfigResult<()> {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{field_name} 必须大于0")));
        }
        if value > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} 不能超过 {max}"
            )));
        }
        Ok(())
    }

    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(ConfigError::Validation(format!("{field_name} 必须大于0")));
        }
        if count > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} 不能超过 {max}"
            )));
        }
        Ok(())
    }
}
