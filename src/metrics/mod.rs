//! # Prometheus 指标收集模块
//!
//! 群聊同步核心的计数器与仪表盘。所有指标默认注册到全局 [`REGISTRY`]。

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 实时事件丢弃原因标签
pub mod drop_reason {
    /// 事件不属于当前激活群组
    pub const INACTIVE_GROUP: &str = "inactive_group";
    /// 载荷缺少必填字段或无法解析
    pub const MALFORMED: &str = "malformed";
    /// 频道名无法识别
    pub const UNKNOWN_TOPIC: &str = "unknown_topic";
    /// 非群聊消息类型
    pub const UNSUPPORTED_TYPE: &str = "unsupported_type";
}

/// 群聊同步指标
#[derive(Clone)]
pub struct ChatMetrics {
    /// 收到的实时事件数
    pub live_events_received: IntCounter,
    /// 被丢弃的实时事件数（按原因）
    pub live_events_dropped: IntCounterVec,
    /// 合并到已有条目的重复表示数
    pub duplicates_collapsed: IntCounter,
    /// 乐观条目确认数
    pub optimistic_confirmed: IntCounter,
    /// 持久化失败数
    pub send_failures: IntCounter,
    /// 实时广播失败数
    pub broadcast_failures: IntCounter,
    /// 历史拉取失败数
    pub history_fetch_failures: IntCounter,
    /// 过期历史响应丢弃数
    pub stale_history_discarded: IntCounter,
    /// 频道订阅失败数
    pub subscribe_failures: IntCounter,
    /// 当前可见条目数
    pub timeline_entries: IntGauge,
    /// 当前待确认条目数
    pub pending_entries: IntGauge,
}

impl ChatMetrics {
    /// 创建指标并注册到全局注册表
    ///
    /// 同一进程内可能存在多个客户端，重复注册只记录 debug 日志，
    /// 此时后创建的实例不会出现在导出结果中。
    pub fn new() -> prometheus::Result<Self> {
        let metrics = Self::build()?;
        if let Err(e) = metrics.register(&REGISTRY) {
            tracing::debug!("chat metrics not registered globally: {}", e);
        }
        Ok(metrics)
    }

    /// 创建指标并注册到指定注册表，重复注册时返回错误
    pub fn with_registry(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::build()?;
        metrics.register(registry)?;
        Ok(metrics)
    }

    fn build() -> prometheus::Result<Self> {
        Ok(Self {
            live_events_received: IntCounter::new(
                "hub_chat_live_events_received_total",
                "Total number of live channel events received",
            )?,
            live_events_dropped: IntCounterVec::new(
                Opts::new(
                    "hub_chat_live_events_dropped_total",
                    "Total number of live channel events dropped",
                ),
                &["reason"],
            )?,
            duplicates_collapsed: IntCounter::new(
                "hub_chat_duplicates_collapsed_total",
                "Message representations merged into an existing timeline entry",
            )?,
            optimistic_confirmed: IntCounter::new(
                "hub_chat_optimistic_confirmed_total",
                "Optimistic entries promoted to confirmed",
            )?,
            send_failures: IntCounter::new(
                "hub_chat_send_failures_total",
                "Message persistence failures",
            )?,
            broadcast_failures: IntCounter::new(
                "hub_chat_broadcast_failures_total",
                "Live broadcast failures",
            )?,
            history_fetch_failures: IntCounter::new(
                "hub_chat_history_fetch_failures_total",
                "Group history fetch failures",
            )?,
            stale_history_discarded: IntCounter::new(
                "hub_chat_stale_history_discarded_total",
                "History responses discarded because the active group changed",
            )?,
            subscribe_failures: IntCounter::new(
                "hub_chat_subscribe_failures_total",
                "Live channel subscribe failures",
            )?,
            timeline_entries: IntGauge::new(
                "hub_chat_timeline_entries",
                "Entries in the visible timeline",
            )?,
            pending_entries: IntGauge::new(
                "hub_chat_pending_entries",
                "Unconfirmed optimistic entries in the visible timeline",
            )?,
        })
    }

    fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.live_events_received.clone()))?;
        registry.register(Box::new(self.live_events_dropped.clone()))?;
        registry.register(Box::new(self.duplicates_collapsed.clone()))?;
        registry.register(Box::new(self.optimistic_confirmed.clone()))?;
        registry.register(Box::new(self.send_failures.clone()))?;
        registry.register(Box::new(self.broadcast_failures.clone()))?;
        registry.register(Box::new(self.history_fetch_failures.clone()))?;
        registry.register(Box::new(self.stale_history_discarded.clone()))?;
        registry.register(Box::new(self.subscribe_failures.clone()))?;
        registry.register(Box::new(self.timeline_entries.clone()))?;
        registry.register(Box::new(self.pending_entries.clone()))?;
        Ok(())
    }

    pub fn record_dropped(&self, reason: &str) {
        self.live_events_dropped.with_label_values(&[reason]).inc();
    }

    /// 同步可见时间线的规模
    pub fn observe_timeline(&self, entries: usize, pending: usize) {
        self.timeline_entries.set(entries as i64);
        self.pending_entries.set(pending as i64);
    }
}

/// 以文本格式导出全局注册表中的所有指标
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
