use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    engine::EngineConfig,
    observability::ObservabilityConfig,
    runtime::{RetentionConfig, TriggerConfig},
};
use crate::validation::ConfigValidator;

/// 系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 以给定新鲜度窗口构建的配置，其余均为默认值
    pub fn with_freshness_window(freshness_window_seconds: u64) -> Self {
        Self {
            database: DatabaseConfig::default(),
            engine: EngineConfig::with_freshness_window(freshness_window_seconds),
            trigger: TriggerConfig::default(),
            retention: RetentionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序:
    /// 1. 配置文件 (TOML)，未指定时按默认路径查找
    /// 2. 环境变量覆盖 (前缀 `JOBSCHED_`，层级分隔符 `__`)
    ///
    /// `engine.freshness_window_seconds` 必须由文件或环境变量提供。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/jobsched.toml",
                "jobsched.toml",
                "/etc/jobsched/config.toml",
            ];

            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("JOBSCHED")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败，请确认已设置 engine.freshness_window_seconds")?;

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

    pub fn freshness_window(&self) -> chrono::Duration {
        self.engine.freshness_window()
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        self.engine.lock_ttl()
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.engine.validate().context("引擎配置验证失败")?;
        self.trigger.validate().context("触发器配置验证失败")?;
        self.retention.validate().context("数据保留配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}
