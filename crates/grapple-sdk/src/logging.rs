//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 默认日志级别（`RUST_LOG` 未设置时）
pub const DEFAULT_DIRECTIVE: &str = "info";

/// 初始化全局日志
///
/// - 级别由 `RUST_LOG` 控制，默认 `info`
/// - `log` crate 的记录会转发给 tracing
///
/// 重复调用是安全的：已经安装过的订阅者会被保留。
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    // 订阅者可能已经安装了桥接，此时忽略错误
    let _ = tracing_log::LogTracer::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
        tracing::info!("logging initialised");
        log::info!("log records are bridged");
    }
}
