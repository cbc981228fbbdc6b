use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::group::GroupId;
use super::identity::SessionIdentity;
use crate::utils::{millis_between, new_client_msg_id};

/// 群聊消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// 服务端消息 ID（持久化后才有）
    pub message_id: Option<String>,
    /// 客户端关联 ID（发送时生成，服务端可能回显）
    pub client_msg_id: Option<String>,
    pub group_id: GroupId,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_verified: bool,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// 去重身份视图
    pub fn dedup_key(&self) -> DedupKey<'_> {
        DedupKey {
            message_id: self.message_id.as_deref(),
            client_msg_id: self.client_msg_id.as_deref(),
            sender_id: &self.sender_id,
            content: &self.content,
            created_at: self.created_at,
        }
    }

    /// 吸收同一逻辑消息的另一种表示
    ///
    /// 带服务端 ID 的表示是权威的：采用其时间戳与发送者展示信息。
    /// 返回 `created_at` 是否发生变化（调用方需要据此重新定位）。
    pub fn absorb(&mut self, incoming: Message) -> bool {
        let authoritative = incoming.message_id.is_some() && self.message_id.is_none();
        if self.client_msg_id.is_none() {
            self.client_msg_id = incoming.client_msg_id;
        }
        if !authoritative {
            return false;
        }

        self.message_id = incoming.message_id;
        self.sender_name = incoming.sender_name;
        self.sender_verified = incoming.sender_verified;
        let moved = self.created_at != incoming.created_at;
        self.created_at = incoming.created_at;
        moved
    }
}

/// 去重身份
///
/// 匹配优先级：服务端消息 ID > 客户端关联 ID > (发送者, 内容, 时间窗口)。
/// 同类 ID 双方都存在时只比较 ID，不再回退到内容匹配。
#[derive(Debug, Clone, Copy)]
pub struct DedupKey<'a> {
    pub message_id: Option<&'a str>,
    pub client_msg_id: Option<&'a str>,
    pub sender_id: &'a str,
    pub content: &'a str,
    pub created_at: DateTime<Utc>,
}

impl DedupKey<'_> {
    /// 判断两个表示是否为同一逻辑消息
    pub fn matches(&self, other: &DedupKey<'_>, window_ms: i64) -> bool {
        if let (Some(a), Some(b)) = (self.message_id, other.message_id) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (self.client_msg_id, other.client_msg_id) {
            return a == b;
        }
        self.sender_id == other.sender_id
            && self.content == other.content
            && millis_between(&self.created_at, &other.created_at) <= window_ms
    }
}

/// 时间线条目的投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// 本地乐观显示，尚未收到服务端确认
    Pending,
    /// 已由历史、实时回显或持久化响应确认
    Confirmed,
}

/// 用户发出的消息草稿
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub group_id: GroupId,
    pub client_msg_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_verified: bool,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    /// 以当前身份构造草稿（内容应已去除首尾空白）
    pub fn new(group_id: GroupId, identity: &SessionIdentity, content: String) -> Self {
        Self {
            group_id,
            client_msg_id: new_client_msg_id(),
            sender_id: identity.user_id.clone(),
            sender_name: identity.display_name.clone(),
            sender_verified: identity.is_verified(),
            content,
            created_at: Utc::now(),
        }
    }

    /// 对应的本地乐观消息
    pub fn to_message(&self) -> Message {
        Message {
            message_id: None,
            client_msg_id: Some(self.client_msg_id.clone()),
            group_id: self.group_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            sender_verified: self.sender_verified,
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VerificationBadge;
    use crate::utils::millis_to_datetime;

    fn message(sender: &str, content: &str, at_ms: i64) -> Message {
        Message {
            message_id: None,
            client_msg_id: None,
            group_id: GroupId::from("g1"),
            sender_id: sender.to_string(),
            sender_name: sender.to_uppercase(),
            sender_verified: false,
            content: content.to_string(),
            created_at: millis_to_datetime(at_ms).unwrap(),
        }
    }

    #[test]
    fn test_fallback_match_within_window() {
        let a = message("u1", "hello", 10_000);
        let b = message("u1", "hello", 11_500);
        let c = message("u1", "hello", 13_000);
        assert!(a.dedup_key().matches(&b.dedup_key(), 2_000));
        assert!(!a.dedup_key().matches(&c.dedup_key(), 2_000));
    }

    #[test]
    fn test_fallback_requires_same_sender_and_content() {
        let a = message("u1", "hello", 10_000);
        assert!(!a.dedup_key().matches(&message("u2", "hello", 10_000).dedup_key(), 2_000));
        assert!(!a.dedup_key().matches(&message("u1", "hello!", 10_000).dedup_key(), 2_000));
    }

    #[test]
    fn test_distinct_server_ids_never_collapse() {
        let mut a = message("u1", "hello", 10_000);
        let mut b = message("u1", "hello", 10_000);
        a.message_id = Some("m1".to_string());
        b.message_id = Some("m2".to_string());
        assert!(!a.dedup_key().matches(&b.dedup_key(), 2_000));
    }

    #[test]
    fn test_correlation_id_wins_over_time_window() {
        let mut a = message("u1", "hello", 10_000);
        let mut b = message("u1", "hello", 60_000);
        a.client_msg_id = Some("c1".to_string());
        b.client_msg_id = Some("c1".to_string());
        assert!(a.dedup_key().matches(&b.dedup_key(), 2_000));

        b.client_msg_id = Some("c2".to_string());
        b.created_at = a.created_at;
        assert!(!a.dedup_key().matches(&b.dedup_key(), 2_000));
    }

    #[test]
    fn test_absorb_adopts_server_fields() {
        let mut local = message("u1", "hello", 10_000);
        local.client_msg_id = Some("c1".to_string());

        let mut record = message("u1", "hello", 10_400);
        record.message_id = Some("m9".to_string());
        record.sender_name = "Farmer Joe".to_string();

        assert!(local.absorb(record));
        assert_eq!(local.message_id.as_deref(), Some("m9"));
        assert_eq!(local.client_msg_id.as_deref(), Some("c1"));
        assert_eq!(local.sender_name, "Farmer Joe");
        assert_eq!(local.created_at.timestamp_millis(), 10_400);
    }

    #[test]
    fn test_absorb_keeps_existing_without_server_id() {
        let mut local = message("u1", "hello", 10_000);
        let echo = message("u1", "hello", 10_900);
        assert!(!local.absorb(echo));
        assert_eq!(local.created_at.timestamp_millis(), 10_000);
    }

    #[test]
    fn test_outgoing_carries_identity() {
        let identity = SessionIdentity::new("u7", "Asha", VerificationBadge::Verified);
        let draft = OutgoingMessage::new(GroupId::from("g1"), &identity, "rain tomorrow".into());
        let msg = draft.to_message();
        assert!(msg.sender_verified);
        assert_eq!(msg.client_msg_id.as_deref(), Some(draft.client_msg_id.as_str()));
        assert!(msg.message_id.is_none());
    }
}
