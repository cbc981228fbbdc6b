//! REST 协作方接口
//!
//! 群组列表、历史拉取、消息持久化与建群。两个实现：
//! - [`HttpHubApi`]：真实后端（reqwest）
//! - [`MemoryHubApi`]：进程内后端，带审核、失败注入与历史闸门

pub mod http;
pub mod memory;

pub use http::HttpHubApi;
pub use memory::MemoryHubApi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::model::{Group, GroupId, Message, OutgoingMessage, SessionIdentity, WireMessage};

/// 建群请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: String,
}

/// REST 协作方
#[async_trait]
pub trait HubApi: Send + Sync {
    /// 群组列表（可能包含未审核群组，由调用方过滤）
    async fn list_groups(&self) -> Result<Vec<Group>>;

    /// 拉取群组历史消息
    async fn fetch_group_messages(&self, group_id: &GroupId) -> Result<Vec<Message>>;

    /// 持久化一条消息
    ///
    /// 后端返回存储记录时为 `Some`，仅返回确认时为 `None`。
    async fn post_group_message(&self, draft: &OutgoingMessage) -> Result<Option<Message>>;

    /// 创建群组，新群组处于待审核状态
    async fn create_group(
        &self,
        request: &CreateGroupRequest,
        creator: &SessionIdentity,
    ) -> Result<Group>;
}

/// 将历史记录转换为领域消息，缺少必填字段的记录被跳过
pub(crate) fn decode_history(records: Vec<WireMessage>, group_id: &GroupId) -> Vec<Message> {
    records
        .into_iter()
        .filter_map(|record| match record.into_message(Some(group_id)) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(group_id = %group_id, error = %e, "skipping malformed history record");
                None
            }
        })
        .collect()
}
