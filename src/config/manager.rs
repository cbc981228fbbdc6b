//! 配置管理器 - 负责处理不同环境下的配置覆盖
//!
//! 该模块提供了配置管理功能，包括：
//! - 根据 `FARMHUB_ENV` 加载环境特定配置
//! - 以环境变量覆盖连接参数

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::{HubChatConfig, merge_value};

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从环境变量 FARMHUB_ENV 获取当前环境名称，
    /// 如果未设置则默认为 "development"
    pub fn get_environment() -> String {
        env::var("FARMHUB_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 根据环境加载特定配置
    ///
    /// 加载 config/environments/{environment}.toml 文件，
    /// 深度合并到尚未类型化的基础配置树中
    pub fn load_environment_config(base: &mut toml::Value) -> Result<()> {
        let env = Self::get_environment();
        let env_config_path = format!("config/environments/{}.toml", env);
        Self::merge_overlay_file(base, Path::new(&env_config_path))
    }

    /// 合并单个覆盖文件，文件不存在时忽略
    pub fn merge_overlay_file(base: &mut toml::Value, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取环境配置文件: {}", path.display()))?;
        let overlay: toml::Value = toml::from_str(&content)
            .with_context(|| format!("无效的环境配置格式: {}", path.display()))?;

        merge_value(base, overlay);
        tracing::debug!(path = %path.display(), "environment config overlay applied");
        Ok(())
    }

    /// 应用环境变量覆盖
    ///
    /// - `FARMHUB_API_BASE_URL` → `api.base_url`
    /// - `FARMHUB_API_TOKEN` → `api.auth_token`
    /// - `FARMHUB_GATEWAY_URL` → `gateway.url`
    pub fn apply_env_overrides(config: &mut HubChatConfig) {
        Self::apply_overrides_from(config, |key| env::var(key).ok());
    }

    fn apply_overrides_from<F>(config: &mut HubChatConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup("FARMHUB_API_BASE_URL").filter(|v| !v.is_empty()) {
            config.api.base_url = base_url;
        }
        if let Some(token) = lookup("FARMHUB_API_TOKEN").filter(|v| !v.is_empty()) {
            config.api.auth_token = Some(token);
        }
        if let Some(url) = lookup("FARMHUB_GATEWAY_URL").filter(|v| !v.is_empty()) {
            config.gateway.url = url;
        }
    }
}
