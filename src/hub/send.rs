//! 发送管线
//!
//! 持久化与实时广播并发执行，两者互不依赖：持久化成功而广播失败时其他成员在下次拉取历史时看到消息，
//! 广播先于持久化到达时由时间线合并规则吸收。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::api::HubApi;
use crate::error::{HubChatError, Result};
use crate::model::{Message, OutgoingMessage, WireMessage};
use crate::transport::{LiveChannel, Topic};

/// 发送回执（持久化完成后返回）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub client_msg_id: String,
    /// 服务端返回存储记录时的消息 ID
    pub message_id: Option<String>,
    /// 实时广播是否成功发出
    pub broadcast: bool,
}

/// 两路结果
pub struct Dispatched {
    pub persisted: Result<Option<Message>>,
    pub broadcast: Result<()>,
}

impl Dispatched {
    /// 持久化失败时返回其错误（广播结果只体现在回执里）
    pub fn into_receipt(self, draft: &OutgoingMessage) -> Result<SendReceipt> {
        let broadcast = self.broadcast.is_ok();
        self.persisted.map(|record| SendReceipt {
            client_msg_id: draft.client_msg_id.clone(),
            message_id: record.and_then(|m| m.message_id),
            broadcast,
        })
    }
}

pub struct SendPipeline;

impl SendPipeline {
    /// 去除首尾空白，拒绝空内容
    pub fn prepare(content: &str) -> Result<String> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(HubChatError::EmptyContent);
        }
        Ok(trimmed.to_string())
    }

    /// 并发执行持久化与实时广播
    ///
    /// `channel` 为 `Err` 表示会话当前未连接，此时只做持久化。
    pub async fn dispatch(
        api: Arc<dyn HubApi>,
        channel: Result<Arc<dyn LiveChannel>>,
        topic: Topic,
        draft: &OutgoingMessage,
    ) -> Dispatched {
        let broadcast = async {
            let channel = channel?;
            let payload = serde_json::to_value(WireMessage::from_outgoing(draft))?;
            channel.publish(&topic, payload).await?;
            Ok::<(), HubChatError>(())
        };
        let (persisted, broadcast) = tokio::join!(api.post_group_message(draft), broadcast);

        match &persisted {
            Ok(record) => debug!(
                client_msg_id = %draft.client_msg_id,
                stored = record.is_some(),
                "message persisted"
            ),
            Err(e) => warn!(client_msg_id = %draft.client_msg_id, error = %e, "message persistence failed"),
        }
        if let Err(e) = &broadcast {
            warn!(client_msg_id = %draft.client_msg_id, topic = %topic, error = %e, "live broadcast failed");
        }

        Dispatched {
            persisted,
            broadcast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryHubApi;
    use crate::model::{GroupId, SessionIdentity, VerificationBadge};
    use crate::transport::{GatewayEvent, LocalSocketGateway, SocketGateway};

    #[test]
    fn test_prepare_trims_and_rejects_blank() {
        assert_eq!(SendPipeline::prepare("  hello \n").unwrap(), "hello");
        assert!(matches!(
            SendPipeline::prepare(" \t "),
            Err(HubChatError::EmptyContent)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_persists_and_broadcasts() {
        let api = MemoryHubApi::new();
        let group = api.add_group("g1", "Paddy");
        let gateway = LocalSocketGateway::new(8);
        let identity = SessionIdentity::new("u1", "Asha", VerificationBadge::None);
        let mut conn = gateway.connect(&identity).await.unwrap();
        let topic = Topic::for_group("group", &group);
        conn.channel.subscribe(&topic).await.unwrap();

        let draft = OutgoingMessage::new(group.clone(), &identity, "hello".to_string());
        let result = SendPipeline::dispatch(
            Arc::new(api.clone()),
            Ok(conn.channel.clone()),
            topic.clone(),
            &draft,
        )
        .await;

        let receipt = result.into_receipt(&draft).unwrap();
        assert!(receipt.broadcast);
        assert!(receipt.message_id.is_some());
        assert_eq!(api.stored_messages(&group).len(), 1);

        assert_eq!(conn.events.recv().await, Some(GatewayEvent::Connected));
        match conn.events.recv().await {
            Some(GatewayEvent::Delivered { payload, .. }) => {
                assert_eq!(payload["type"], "new-group-message");
                assert_eq!(payload["client_msg_id"], draft.client_msg_id.as_str());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block_broadcast() {
        let api = MemoryHubApi::new();
        let group = api.add_group("g1", "Paddy");
        api.fail_posts(true);
        let identity = SessionIdentity::new("u1", "Asha", VerificationBadge::None);
        let gateway = LocalSocketGateway::new(8);
        let conn = gateway.connect(&identity).await.unwrap();

        let draft = OutgoingMessage::new(group.clone(), &identity, "hello".to_string());
        let result = SendPipeline::dispatch(
            Arc::new(api),
            Ok(conn.channel.clone()),
            Topic::for_group("group", &group),
            &draft,
        )
        .await;
        assert!(result.broadcast.is_ok());
        assert!(matches!(
            result.into_receipt(&draft),
            Err(HubChatError::Api { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnected_session_still_persists() {
        let api = MemoryHubApi::new();
        let group = api.add_group("g1", "Paddy");
        let identity = SessionIdentity::new("u1", "Asha", VerificationBadge::None);
        let draft = OutgoingMessage::new(GroupId::from("g1"), &identity, "hello".to_string());

        let result = SendPipeline::dispatch(
            Arc::new(api.clone()),
            Err(HubChatError::NotConnected),
            Topic::for_group("group", &group),
            &draft,
        )
        .await;
        let receipt = result.into_receipt(&draft).unwrap();
        assert!(!receipt.broadcast);
        assert_eq!(api.post_requests(), 1);
    }
}
