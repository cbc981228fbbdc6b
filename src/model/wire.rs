//! REST 与实时通道的 JSON 线格式
//!
//! 字段沿用后端的 snake_case 命名。后端 ID 可能是数字也可能是字符串，
//! 反序列化时统一转为字符串；缺失必填字段的记录在转换为领域模型时被拒绝。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::group::{Group, GroupId, GroupStatus};
use super::message::{Message, OutgoingMessage};
use crate::error::{HubChatError, Result};
use crate::utils::parse_rfc3339;

/// 实时事件类型标记
pub const NEW_GROUP_MESSAGE: &str = "new-group-message";

/// 群聊消息线格式（历史记录与实时事件共用）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub group_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default, deserialize_with = "opt_flag")]
    pub is_verified: Option<bool>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl WireMessage {
    /// 由发送草稿构造实时广播载荷
    pub fn from_outgoing(draft: &OutgoingMessage) -> Self {
        Self {
            kind: Some(NEW_GROUP_MESSAGE.to_string()),
            id: None,
            client_msg_id: Some(draft.client_msg_id.clone()),
            group_id: Some(draft.group_id.to_string()),
            sender_id: Some(draft.sender_id.clone()),
            sender_name: Some(draft.sender_name.clone()),
            is_verified: Some(draft.sender_verified),
            content: Some(draft.content.clone()),
            created_at: Some(draft.created_at.to_rfc3339()),
        }
    }

    /// 由领域消息构造线格式（用于内存后端与测试夹具）
    pub fn from_message(message: &Message) -> Self {
        Self {
            kind: None,
            id: message.message_id.clone(),
            client_msg_id: message.client_msg_id.clone(),
            group_id: Some(message.group_id.to_string()),
            sender_id: Some(message.sender_id.clone()),
            sender_name: Some(message.sender_name.clone()),
            is_verified: Some(message.sender_verified),
            content: Some(message.content.clone()),
            created_at: Some(message.created_at.to_rfc3339()),
        }
    }

    /// 解析任意 JSON 载荷
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| HubChatError::MalformedPayload(err.to_string()))
    }

    /// 转换为领域消息
    ///
    /// `fallback_group` 用于按群组拉取的历史记录（记录本身可能不带 group_id）。
    pub fn into_message(self, fallback_group: Option<&GroupId>) -> Result<Message> {
        let group_id = match (self.group_id, fallback_group) {
            (Some(id), _) => GroupId::from(id),
            (None, Some(fallback)) => fallback.clone(),
            (None, None) => return Err(missing("group_id")),
        };
        let sender_id = self.sender_id.ok_or_else(|| missing("sender_id"))?;
        let sender_name = self.sender_name.ok_or_else(|| missing("sender_name"))?;
        let content = self.content.ok_or_else(|| missing("content"))?;
        let raw_created_at = self.created_at.ok_or_else(|| missing("created_at"))?;
        let created_at = parse_rfc3339(&raw_created_at).ok_or_else(|| {
            HubChatError::MalformedPayload(format!("invalid created_at: {raw_created_at}"))
        })?;

        Ok(Message {
            message_id: self.id,
            client_msg_id: self.client_msg_id,
            group_id,
            sender_id,
            sender_name,
            sender_verified: self.is_verified.unwrap_or(false),
            content,
            created_at,
        })
    }
}

/// 群组线格式
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireGroup {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub creator_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// 后端以 0/1 或布尔值表示审核结果，缺失表示服务端已按可见性过滤
    #[serde(default)]
    pub is_approved: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
}

impl WireGroup {
    pub fn from_group(group: &Group) -> Self {
        Self {
            id: Some(group.id.to_string()),
            name: Some(group.name.clone()),
            description: Some(group.description.clone()),
            created_by: group.created_by.clone(),
            creator_name: group.creator_name.clone(),
            created_at: group.created_at.map(|ts| ts.to_rfc3339()),
            is_approved: None,
            status: Some(status_label(group.status).to_string()),
        }
    }

    pub fn into_group(self) -> Result<Group> {
        let id = self.id.ok_or_else(|| missing("id"))?;
        let name = self.name.ok_or_else(|| missing("name"))?;
        let status = match self.status.as_deref() {
            Some("pending") => GroupStatus::Pending,
            Some("approved") => GroupStatus::Approved,
            Some("rejected") => GroupStatus::Rejected,
            _ => approval_status(self.is_approved.as_ref()),
        };
        let created_at: Option<DateTime<Utc>> =
            self.created_at.as_deref().and_then(parse_rfc3339);

        Ok(Group {
            id: GroupId::from(id),
            name,
            description: self.description.unwrap_or_default(),
            created_by: self.created_by,
            creator_name: self.creator_name,
            created_at,
            status,
        })
    }
}

fn status_label(status: GroupStatus) -> &'static str {
    match status {
        GroupStatus::Pending => "pending",
        GroupStatus::Approved => "approved",
        GroupStatus::Rejected => "rejected",
    }
}

fn approval_status(raw: Option<&Value>) -> GroupStatus {
    match raw {
        None | Some(Value::Null) => GroupStatus::Approved,
        Some(Value::Bool(true)) => GroupStatus::Approved,
        Some(Value::Bool(false)) => GroupStatus::Pending,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(1) => GroupStatus::Approved,
            Some(0) => GroupStatus::Pending,
            _ => GroupStatus::Rejected,
        },
        Some(_) => GroupStatus::Pending,
    }
}

fn missing(field: &str) -> HubChatError {
    HubChatError::MalformedPayload(format!("missing field `{field}`"))
}

fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
        Some(Value::String(s)) => Ok(Some(matches!(s.as_str(), "true" | "1" | "verified"))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected boolean flag, got {other}"
        ))),
    }
}
