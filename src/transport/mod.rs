//! 实时传输会话
//!
//! 外部 Socket 网关的抽象：
//! - [`SocketGateway`]：按会话身份建立连接
//! - [`LiveChannel`]：频道订阅、退订与发布
//! - [`TransportSession`]：连接生命周期与认证会话绑定，断开期间拒绝频道操作
//!
//! 重连策略由网关负责，会话只跟踪连接状态并在重新连上后通知上层补订阅。

pub mod local;

pub use local::LocalSocketGateway;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{HubChatError, Result};
use crate::model::{GroupId, SessionIdentity};

/// 频道名（一个群组对应一个频道）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// 群组频道名：`{prefix}:{group_id}`
    pub fn for_group(prefix: &str, group_id: &GroupId) -> Self {
        Self(format!("{}:{}", prefix, group_id))
    }

    /// 从频道名中解析群组 ID，前缀不匹配时返回 None
    pub fn group_id(&self, prefix: &str) -> Option<GroupId> {
        self.0
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|id| !id.is_empty())
            .map(GroupId::from)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 网关下发的事件
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// 频道消息
    Delivered { topic: Topic, payload: Value },
    /// 连接已建立（首次或重连）
    Connected,
    /// 连接中断，网关会自行重连
    Disconnected { reason: String },
}

/// 实时频道操作
#[async_trait]
pub trait LiveChannel: Send + Sync {
    async fn subscribe(&self, topic: &Topic) -> Result<()>;

    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;

    /// 向频道发布载荷（包括发布者自身在内的所有订阅者都会收到）
    async fn publish(&self, topic: &Topic, payload: Value) -> Result<()>;

    /// 关闭连接，之后的操作均失败
    async fn close(&self) -> Result<()>;
}

/// 一次成功的网关连接
pub struct GatewayConnection {
    pub channel: Arc<dyn LiveChannel>,
    pub events: mpsc::Receiver<GatewayEvent>,
}

/// Socket 网关
#[async_trait]
pub trait SocketGateway: Send + Sync {
    async fn connect(&self, identity: &SessionIdentity) -> Result<GatewayConnection>;
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 未连接或已主动断开
    Disconnected,
    /// 已连接
    Connected,
    /// 连接中断，等待网关重连
    Interrupted,
}

/// 传输会话
///
/// 生命周期与认证会话绑定：登录后 `connect`，登出或会话失效时 `disconnect`。
pub struct TransportSession {
    gateway: Arc<dyn SocketGateway>,
    identity: SessionIdentity,
    channel: Option<Arc<dyn LiveChannel>>,
    state: ConnectionState,
}

impl TransportSession {
    pub fn new(gateway: Arc<dyn SocketGateway>, identity: SessionIdentity) -> Self {
        Self {
            gateway,
            identity,
            channel: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// 建立连接，返回入站事件流
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<GatewayEvent>> {
        if self.channel.is_some() {
            self.disconnect().await;
        }

        let connection = self.gateway.connect(&self.identity).await?;
        self.channel = Some(connection.channel);
        self.state = ConnectionState::Connected;
        info!(user_id = %self.identity.user_id, "transport session connected");
        Ok(connection.events)
    }

    /// 断开连接（幂等）
    pub async fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "failed to close live channel");
            }
            info!(user_id = %self.identity.user_id, "transport session disconnected");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// 处理网关连接事件
    ///
    /// 返回 true 表示从中断中恢复，调用方需要重新订阅当前频道。
    pub fn on_gateway_event(&mut self, event: &GatewayEvent) -> bool {
        if self.channel.is_none() {
            return false;
        }
        match event {
            GatewayEvent::Connected => {
                let recovered = self.state == ConnectionState::Interrupted;
                self.state = ConnectionState::Connected;
                if recovered {
                    info!(user_id = %self.identity.user_id, "transport session reconnected");
                }
                recovered
            }
            GatewayEvent::Disconnected { reason } => {
                if self.state == ConnectionState::Connected {
                    warn!(user_id = %self.identity.user_id, reason = %reason, "transport session interrupted");
                }
                self.state = ConnectionState::Interrupted;
                false
            }
            GatewayEvent::Delivered { .. } => false,
        }
    }

    /// 当前可用的频道句柄
    pub fn channel(&self) -> Result<Arc<dyn LiveChannel>> {
        match (&self.channel, self.state) {
            (Some(channel), ConnectionState::Connected) => Ok(channel.clone()),
            _ => Err(HubChatError::NotConnected),
        }
    }

    pub async fn subscribe(&self, topic: &Topic) -> Result<()> {
        self.channel()?.subscribe(topic).await?;
        debug!(topic = %topic, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.channel()?.unsubscribe(topic).await?;
        debug!(topic = %topic, "unsubscribed");
        Ok(())
    }

    pub async fn publish(&self, topic: &Topic, payload: Value) -> Result<()> {
        self.channel()?.publish(topic, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VerificationBadge;

    fn identity() -> SessionIdentity {
        SessionIdentity::new("u1", "Asha", VerificationBadge::None)
    }

    #[test]
    fn test_topic_round_trip() {
        let topic = Topic::for_group("group", &GroupId::from("42"));
        assert_eq!(topic.as_str(), "group:42");
        assert_eq!(topic.group_id("group"), Some(GroupId::from("42")));
        assert_eq!(topic.group_id("room"), None);
        assert_eq!(Topic::new("group:").group_id("group"), None);
    }

    #[tokio::test]
    async fn test_operations_refused_before_connect() {
        let gateway = Arc::new(LocalSocketGateway::new(16));
        let session = TransportSession::new(gateway, identity());
        let result = session.subscribe(&Topic::new("group:1")).await;
        assert!(matches!(result, Err(HubChatError::NotConnected)));
    }

    #[tokio::test]
    async fn test_interruption_and_recovery() {
        let gateway = Arc::new(LocalSocketGateway::new(16));
        let mut session = TransportSession::new(gateway, identity());
        let _events = session.connect().await.unwrap();
        assert!(session.is_connected());

        let interrupted = GatewayEvent::Disconnected {
            reason: "transport close".to_string(),
        };
        assert!(!session.on_gateway_event(&interrupted));
        assert_eq!(session.state(), ConnectionState::Interrupted);
        assert!(matches!(
            session.publish(&Topic::new("group:1"), Value::Null).await,
            Err(HubChatError::NotConnected)
        ));

        assert!(session.on_gateway_event(&GatewayEvent::Connected));
        assert!(session.is_connected());
        // 已连接状态下重复的 Connected 不触发补订阅
        assert!(!session.on_gateway_event(&GatewayEvent::Connected));

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
