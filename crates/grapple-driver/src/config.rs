//! 驱动配置
//!
//! 控制 IO 线程、缓存和配置请求的行为，可从 TOML 文件加载：
//!
//! ```toml
//! receive_timeout_ms = 2
//! stale_timeout_ms = 500
//! request_timeout_ms = 200
//! request_retries = 3
//! ```
//!
//! 未出现的字段取默认值。

use crate::error::DriverError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 驱动配置
///
/// # Example
///
/// ```
/// use grapple_driver::DriverConfig;
///
/// let config = DriverConfig::from_toml_str("stale_timeout_ms = 250").unwrap();
/// assert_eq!(config.stale_timeout_ms, 250);
/// assert_eq!(config.request_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// CAN 接收超时（毫秒），决定 IO 线程响应关闭的速度
    pub receive_timeout_ms: u64,
    /// 状态帧超过此时间未更新即视为过期（毫秒）
    pub stale_timeout_ms: u64,
    /// 单次配置请求等待 ack 的时间（毫秒）
    pub request_timeout_ms: u64,
    /// 首次发送之后的重试次数
    pub request_retries: u32,
    /// 命令队列容量
    pub command_queue_capacity: usize,
    /// 关闭时等待 IO 线程退出的时间（毫秒）
    pub join_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 2,
            stale_timeout_ms: 500,
            request_timeout_ms: 200,
            request_retries: 3,
            command_queue_capacity: 64,
            join_timeout_ms: 500,
        }
    }
}

impl DriverConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, DriverError> {
        let config: DriverConfig = toml::from_str(content)
            .map_err(|e| DriverError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, DriverError> {
        toml::to_string(self)
            .map_err(|e| DriverError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// 拒绝为零的超时与容量
    pub fn validate(&self) -> Result<(), DriverError> {
        let zero_fields = [
            ("receive_timeout_ms", self.receive_timeout_ms == 0),
            ("stale_timeout_ms", self.stale_timeout_ms == 0),
            ("request_timeout_ms", self.request_timeout_ms == 0),
            ("command_queue_capacity", self.command_queue_capacity == 0),
            ("join_timeout_ms", self.join_timeout_ms == 0),
        ];
        if let Some((name, _)) = zero_fields.iter().find(|(_, is_zero)| *is_zero) {
            return Err(DriverError::Config(format!("{} must be greater than zero", name)));
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.stale_timeout(), Duration::from_millis(500));
        assert_eq!(config.request_timeout(), Duration::from_millis(200));
        assert_eq!(config.request_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = DriverConfig::from_toml_str(
            r#"
            request_timeout_ms = 500
            request_retries = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.request_timeout_ms, 500);
        assert_eq!(config.request_retries, 1);
        assert_eq!(config.receive_timeout_ms, 2);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = DriverConfig::from_toml_str("stale_timeout_ms = 0").unwrap_err();
        match err {
            DriverError::Config(msg) => assert!(msg.contains("stale_timeout_ms")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(matches!(
            DriverConfig::from_toml_str("request_retries = \"many\""),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = DriverConfig {
            join_timeout_ms: 1000,
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(DriverConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            DriverConfig::load("/nonexistent/grapple.toml"),
            Err(DriverError::Config(_))
        ));
    }
}
