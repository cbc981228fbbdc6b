//! FarmHub 群聊同步核心
//!
//! 社区群聊客户端的状态层：群组目录、单一实时频道订阅、按时间排序并去重的消息时间线，
//! 以及先乐观展示再异步持久化的发送流程。REST 与实时网关通过 trait 注入。

pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod timeline;
pub mod tracing;
pub mod transport;
pub mod utils;

pub use api::{CreateGroupRequest, HttpHubApi, HubApi, MemoryHubApi};
pub use config::{ConfigManager, HubChatConfig, load_config};
pub use error::*;
pub use hub::{HubClient, SendReceipt, TimelineStatus, TimelineView};
pub use metrics::ChatMetrics;
pub use model::*;
pub use timeline::{MergeOutcome, Timeline, TimelineEntry};
pub use transport::{
    GatewayEvent, LiveChannel, LocalSocketGateway, SocketGateway, Topic, TransportSession,
};
