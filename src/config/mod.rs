//! FarmHub 群聊核心配置模块
//!
//! 该模块提供了客户端配置管理功能，包括：
//! - 配置文件加载和解析（单文件或目录合并）
//! - 环境特定配置覆盖与环境变量覆盖
//! - REST、实时网关、时间线、发送、日志等配置定义

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

mod manager;
pub use manager::ConfigManager;

/// REST 协作方配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// 后端基础地址（不含 `/api` 前缀）
    pub base_url: String,
    /// Bearer token
    pub auth_token: Option<String>,
    /// 请求超时（毫秒）
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            auth_token: None,
            request_timeout_ms: 10_000,
        }
    }
}

/// 实时网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 网关地址
    pub url: String,
    /// 群组频道名前缀，频道名为 `{prefix}:{group_id}`
    pub topic_prefix: String,
    /// 入站事件缓冲区大小
    pub event_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000".to_string(),
            topic_prefix: "group".to_string(),
            event_buffer: 256,
        }
    }
}

/// 时间线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// 去重时间窗口（毫秒），对应传输层的投递时间粒度
    pub dedup_window_ms: i64,
    /// 缓存的群组时间线数量上限
    pub cache_capacity: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 2_000,
            cache_capacity: 16,
        }
    }
}

/// 发送配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// 乐观条目超过该时长仍未确认时标记为逾期（毫秒）
    pub pending_overdue_ms: i64,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            pending_overdue_ms: 15_000,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// 群聊核心配置主结构体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubChatConfig {
    pub api: ApiConfig,
    pub gateway: GatewayConfig,
    pub timeline: TimelineConfig,
    pub send: SendConfig,
    pub logging: LoggingConfig,
}

impl HubChatConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(anyhow!("api.base_url must not be empty"));
        }
        if self.gateway.topic_prefix.trim().is_empty() {
            return Err(anyhow!("gateway.topic_prefix must not be empty"));
        }
        if self.gateway.event_buffer == 0 {
            return Err(anyhow!("gateway.event_buffer must be greater than 0"));
        }
        if self.timeline.dedup_window_ms <= 0 {
            return Err(anyhow!("timeline.dedup_window_ms must be greater than 0"));
        }
        if self.timeline.cache_capacity == 0 {
            return Err(anyhow!("timeline.cache_capacity must be greater than 0"));
        }
        if self.send.pending_overdue_ms <= 0 {
            return Err(anyhow!("send.pending_overdue_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// 加载配置
///
/// 未指定路径时依次尝试 `config/` 目录与 `config.toml`，都失败则回退到默认值。
/// 随后叠加环境配置与环境变量覆盖，最后校验。
pub fn load_config(path: Option<&str>) -> Result<HubChatConfig> {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
    };

    let mut merged = load_with_fallback(&candidates);
    if let Err(e) = ConfigManager::load_environment_config(&mut merged) {
        warn!("failed to load environment config: {}", e);
    }

    let mut cfg: HubChatConfig = merged
        .try_into()
        .context("invalid configuration after applying environment overlay")?;
    ConfigManager::apply_env_overrides(&mut cfg);
    cfg.validate().context("configuration validation failed")?;
    Ok(cfg)
}

/// 使用备选方案加载配置，全部失败时返回空表（即全部默认值）
fn load_with_fallback(candidates: &[PathBuf]) -> toml::Value {
    for path in candidates {
        match load_value_from_source(path) {
            Ok(value) => return value,
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    toml::Value::Table(toml::map::Map::new())
}

/// 从源加载配置
pub fn load_config_from_source(path: &Path) -> Result<HubChatConfig> {
    let value = load_value_from_source(path)?;
    let cfg: HubChatConfig = value
        .try_into()
        .with_context(|| format!("invalid config format: {}", path.display()))?;
    Ok(cfg)
}

/// 从文件或目录加载未类型化的配置树
fn load_value_from_source(path: &Path) -> Result<toml::Value> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    if metadata.is_dir() {
        load_value_from_directory(path)
    } else {
        load_toml_value(path)
    }
}

/// 从目录加载配置：`base.toml` 之上依次合并 `shared/` 与 `overrides/` 中的片段
fn load_value_from_directory(path: &Path) -> Result<toml::Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("shared"))?;
    merge_directory(&mut merged, &path.join("overrides"))?;

    Ok(merged)
}

/// 合并目录中的配置片段（按文件名排序）
fn merge_directory(root: &mut toml::Value, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let value = load_toml_value(&entry.path())?;
        merge_value(root, value);
    }

    Ok(())
}

/// 加载 TOML 值
fn load_toml_value(path: &Path) -> Result<toml::Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: toml::Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 深度合并：表逐键合并，其余类型整体覆盖
pub(crate) fn merge_value(base: &mut toml::Value, overlay: toml::Value) {
    match overlay {
        toml::Value::Table(overlay_table) => {
            if let toml::Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = toml::Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}
