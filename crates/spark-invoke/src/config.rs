//! 调用配置：从 TOML 文档反序列化。
//!
//! ```toml
//! invocation_timeout_ms = 1500
//! retry_intervals_ms = [0, 100, 500]
//! stale_handler_limit = 16
//! ```
//!
//! - `invocation_timeout_ms` 不大于 0 表示不设截止；
//! - `retry_intervals_ms` 中第 `n` 项为第 `n` 次重试前的等待；单独一个 `-1` 表示禁用重试，
//!   其他负值为配置错误；
//! - 缺省字段取默认值：不设截止、立即重试一次、陈旧上限 16。

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::reference::DEFAULT_STALE_HANDLER_LIMIT;
use crate::retry::IntervalRetryPolicy;

/// 配置解析失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid invocation config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("retry interval {value}ms is negative (only a lone -1 disables retries)")]
    InvalidRetryInterval { value: i64 },
}

/// 调用配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InvocationConfig {
    pub invocation_timeout_ms: i64,
    pub retry_intervals_ms: Vec<i64>,
    pub stale_handler_limit: u32,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: -1,
            retry_intervals_ms: vec![0],
            stale_handler_limit: DEFAULT_STALE_HANDLER_LIMIT,
        }
    }
}

impl InvocationConfig {
    /// 解析并校验 TOML 文档。
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验重试间隔。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retries_disabled() {
            return Ok(());
        }
        match self.retry_intervals_ms.iter().find(|value| **value < 0) {
            Some(value) => Err(ConfigError::InvalidRetryInterval { value: *value }),
            None => Ok(()),
        }
    }

    fn retries_disabled(&self) -> bool {
        self.retry_intervals_ms == [-1]
    }

    /// 调用超时。
    pub fn invocation_timeout(&self) -> Option<Duration> {
        u64::try_from(self.invocation_timeout_ms)
            .ok()
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }

    /// 重试间隔；禁用重试时为空。
    pub fn retry_intervals(&self) -> Vec<Duration> {
        if self.retries_disabled() {
            return Vec::new();
        }
        self.retry_intervals_ms
            .iter()
            .filter_map(|millis| u64::try_from(*millis).ok())
            .map(Duration::from_millis)
            .collect()
    }

    /// 按配置构造间隔重试策略。
    pub fn retry_policy(&self) -> IntervalRetryPolicy {
        IntervalRetryPolicy::new(self.retry_intervals())
    }
}
