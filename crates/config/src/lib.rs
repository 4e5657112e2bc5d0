pub mod models;
pub mod validation;

pub use models::{
    AppConfig, ContentionPolicy, DatabaseConfig, EngineConfig, LogFormat, ObservabilityConfig,
    RetentionConfig, TriggerConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};

/// 配置错误类型
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("配置验证失败: {0}")]
    Validation(String),

    #[error("配置文件错误: {0}")]
    File(String),

    #[error("配置解析错误: {0}")]
    Parse(String),
}

impl From<anyhow::Error> for ConfigError {
    fn from(err: anyhow::Error) -> Self {
        ConfigError::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::File(err.to_string())
    }
}
