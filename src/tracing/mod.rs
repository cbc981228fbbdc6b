//! # 日志初始化模块
//!
//! 基于 `tracing-subscriber` 的 fmt 输出，`RUST_LOG` 优先于配置文件中的日志级别。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// # 参数
/// * `logging_config` - 日志配置（可选），如果为 None 则使用默认配置（info 级别）
///
/// # 示例
/// ```rust,no_run
/// use farmhub_chat_core::config::LoggingConfig;
/// use farmhub_chat_core::tracing::init_tracing_from_config;
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     with_target: false,
///     with_thread_ids: true,
///     with_file: true,
///     with_line_number: true,
/// };
/// init_tracing_from_config(Some(&config));
/// ```
pub fn init_tracing_from_config(logging_config: Option<&LoggingConfig>) {
    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let builder = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter(config));

    // 重复初始化（如测试中）时保留已有的全局 subscriber
    if builder.try_init().is_err() {
        ::tracing::debug!("tracing subscriber already initialised");
    }
}

/// 优先使用环境变量 RUST_LOG，如果没有则使用配置文件的日志级别
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info")),
    }
}
