//! 领域模型
//!
//! - 群组与审核状态
//! - 消息、投递状态与去重身份
//! - 会话身份（只读输入）
//! - REST / 实时通道上的 JSON 线格式

pub mod group;
pub mod identity;
pub mod message;
pub mod wire;

pub use group::{Group, GroupId, GroupStatus};
pub use identity::{SessionIdentity, VerificationBadge};
pub use message::{DedupKey, DeliveryState, Message, OutgoingMessage};
pub use wire::{WireGroup, WireMessage};
