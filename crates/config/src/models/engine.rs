use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 锁竞争处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// 延迟后重新入队，超过次数后标记失败
    #[default]
    RequeueThenFail,
    /// 立即标记失败
    FailFast,
}

impl std::fmt::Display for ContentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentionPolicy::RequeueThenFail => write!(f, "requeue_then_fail"),
            ContentionPolicy::FailFast => write!(f, "fail_fast"),
        }
    }
}

/// 执行引擎配置
///
/// `freshness_window_seconds` 没有默认值，缺失时配置加载失败。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    pub freshness_window_seconds: u64,
    /// 锁租期下限；实际租期不会短于 任务超时 + 安全余量
    #[serde(default)]
    pub lock_ttl_seconds: Option<u64>,
    #[serde(default = "default_lock_safety_margin_seconds")]
    pub lock_safety_margin_seconds: u64,
    /// 任务未配置超时时使用的默认超时
    #[serde(default = "default_execution_timeout_seconds")]
    pub execution_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    #[serde(default)]
    pub contention_policy: ContentionPolicy,
    #[serde(default = "default_max_requeue_attempts")]
    pub max_requeue_attempts: u32,
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
    #[serde(default = "default_true")]
    pub notification_enabled: bool,
    /// 无人跟踪的 PENDING 执行超过该时长后视为孤儿；为空时取默认锁租期
    #[serde(default)]
    pub orphan_pending_seconds: Option<u64>,
}

fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

fn default_lock_safety_margin_seconds() -> u64 {
    30
}

fn default_execution_timeout_seconds() -> u64 {
    3600
}

fn default_max_concurrent_executions() -> usize {
    16
}

fn default_max_requeue_attempts() -> u32 {
    1
}

fn default_requeue_delay_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// 以给定新鲜度窗口构建配置，其余字段取默认值
    pub fn with_freshness_window(freshness_window_seconds: u64) -> Self {
        Self {
            instance_id: default_instance_id(),
            freshness_window_seconds,
            lock_ttl_seconds: None,
            lock_safety_margin_seconds: default_lock_safety_margin_seconds(),
            execution_timeout_seconds: default_execution_timeout_seconds(),
            max_concurrent_executions: default_max_concurrent_executions(),
            contention_policy: ContentionPolicy::default(),
            max_requeue_attempts: default_max_requeue_attempts(),
            requeue_delay_ms: default_requeue_delay_ms(),
            notification_enabled: true,
            orphan_pending_seconds: None,
        }
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.freshness_window_seconds as i64)
    }

    /// 任务的有效超时
    pub fn effective_timeout(&self, job_timeout_seconds: Option<u64>) -> std::time::Duration {
        std::time::Duration::from_secs(job_timeout_seconds.unwrap_or(self.execution_timeout_seconds))
    }

    /// 默认超时下的锁租期
    pub fn lock_ttl(&self) -> chrono::Duration {
        self.lock_ttl_for(None)
    }

    /// 锁租期 = 任务超时 + 安全余量；配置的固定租期只能延长，不能缩短
    pub fn lock_ttl_for(&self, job_timeout_seconds: Option<u64>) -> chrono::Duration {
        let minimum = job_timeout_seconds.unwrap_or(self.execution_timeout_seconds)
            + self.lock_safety_margin_seconds;
        let seconds = self.lock_ttl_seconds.map_or(minimum, |fixed| fixed.max(minimum));
        chrono::Duration::seconds(seconds as i64)
    }

    /// PENDING 执行被判定为孤儿前的等待时长
    pub fn orphan_pending_after(&self) -> chrono::Duration {
        match self.orphan_pending_seconds {
            Some(seconds) => chrono::Duration::seconds(seconds as i64),
            None => self.lock_ttl(),
        }
    }
}

impl ConfigValidator for EngineConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.instance_id, "engine.instance_id")?;
        ValidationUtils::validate_seconds(
            self.freshness_window_seconds,
            "engine.freshness_window_seconds",
            365 * 86400,
        )?;
        ValidationUtils::validate_seconds(
            self.execution_timeout_seconds,
            "engine.execution_timeout_seconds",
            7 * 86400,
        )?;
        if let Some(ttl) = self.lock_ttl_seconds {
            ValidationUtils::validate_seconds(ttl, "engine.lock_ttl_seconds", 7 * 86400)?;
            if ttl <= self.execution_timeout_seconds {
                return Err(crate::ConfigError::Validation(format!(
                    "engine.lock_ttl_seconds ({}) 必须大于 engine.execution_timeout_seconds ({})",
                    ttl, self.execution_timeout_seconds
                )));
            }
        }
        if let Some(seconds) = self.orphan_pending_seconds {
            ValidationUtils::validate_seconds(seconds, "engine.orphan_pending_seconds", 7 * 86400)?;
        }
        ValidationUtils::validate_count(
            self.max_concurrent_executions,
            "engine.max_concurrent_executions",
            10000,
        )?;
        if self.max_requeue_attempts > 100 {
            return Err(crate::ConfigError::Validation(
                "engine.max_requeue_attempts 不能超过 100".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_ttl_is_timeout_plus_margin() {
        let mut config = EngineConfig::with_freshness_window(3600);
        config.lock_safety_margin_seconds = 10;
        config.execution_timeout_seconds = 60;

        assert_eq!(config.lock_ttl(), chrono::Duration::seconds(70));
        assert_eq!(config.lock_ttl_for(Some(5)), chrono::Duration::seconds(15));

        // 固定租期短于 超时 + 余量 时不生效
        config.lock_ttl_seconds = Some(5);
        assert_eq!(config.lock_ttl_for(Some(100)), chrono::Duration::seconds(110));
        config.lock_ttl_seconds = Some(500);
        assert_eq!(config.lock_ttl_for(Some(100)), chrono::Duration::seconds(500));
    }

    #[test]
    fn test_lock_ttl_must_exceed_execution_timeout() {
        let mut config = EngineConfig::with_freshness_window(3600);
        config.lock_ttl_seconds = Some(1);
        assert!(config.validate().is_err());

        config.lock_ttl_seconds = Some(config.execution_timeout_seconds);
        assert!(config.validate().is_err());

        config.lock_ttl_seconds = Some(config.execution_timeout_seconds + 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_orphan_pending_defaults_to_lock_ttl() {
        let mut config = EngineConfig::with_freshness_window(3600);
        assert_eq!(config.orphan_pending_after(), config.lock_ttl());

        config.orphan_pending_seconds = Some(90);
        assert_eq!(config.orphan_pending_after(), chrono::Duration::seconds(90));
    }

    #[test]
    fn test_engine_config_validation() {
        let config = EngineConfig::with_freshness_window(60);
        assert!(config.validate().is_ok());
        assert_eq!(config.contention_policy, ContentionPolicy::RequeueThenFail);
        assert_eq!(config.max_requeue_attempts, 1);

        let mut invalid = config.clone();
        invalid.freshness_window_seconds = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.max_concurrent_executions = 0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_contention_policy_serde_names() {
        let toml_str = r#"
            freshness_window_seconds = 60
            contention_policy = "fail_fast"
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.contention_policy, ContentionPolicy::FailFast);
        assert_eq!(config.contention_policy.to_string(), "fail_fast");
    }
}
