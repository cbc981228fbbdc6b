//! 进程内 Socket 网关
//!
//! 发布会投递给频道的全部订阅者（包括发布者自身），与真实网关的回显行为一致。
//! 提供连接中断/恢复与失败注入，供集成测试和演示使用。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{GatewayConnection, GatewayEvent, LiveChannel, SocketGateway, Topic};
use crate::error::{HubChatError, Result};
use crate::model::SessionIdentity;

struct LocalConnection {
    user_id: String,
    events: mpsc::Sender<GatewayEvent>,
    online: bool,
}

struct Inner {
    event_buffer: usize,
    next_id: AtomicU64,
    /// connection id -> 连接
    connections: DashMap<u64, LocalConnection>,
    /// topic -> 订阅的 connection id
    topics: DashMap<String, HashSet<u64>>,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    fail_unsubscribe: AtomicBool,
}

impl Inner {
    fn ensure_online(&self, id: u64) -> Result<()> {
        match self.connections.get(&id) {
            Some(conn) if conn.online => Ok(()),
            _ => Err(HubChatError::NotConnected),
        }
    }

    fn drop_subscriptions(&self, id: u64) {
        self.topics.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
    }

    /// 投递给频道的在线订阅者，接收端已关闭的连接被移除
    async fn deliver(&self, topic: &Topic, payload: Value) -> usize {
        let ids: Vec<u64> = self
            .topics
            .get(topic.as_str())
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let targets: Vec<(u64, mpsc::Sender<GatewayEvent>)> = ids
            .into_iter()
            .filter_map(|id| {
                self.connections
                    .get(&id)
                    .filter(|conn| conn.online)
                    .map(|conn| (id, conn.events.clone()))
            })
            .collect();

        let mut delivered = 0;
        for (id, sender) in targets {
            let event = GatewayEvent::Delivered {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            if sender.send(event).await.is_ok() {
                delivered += 1;
            } else {
                debug!(connection_id = id, "dropping closed local connection");
                self.connections.remove(&id);
                self.drop_subscriptions(id);
            }
        }
        delivered
    }
}

/// 进程内网关
#[derive(Clone)]
pub struct LocalSocketGateway {
    inner: Arc<Inner>,
}

impl LocalSocketGateway {
    /// `event_buffer` 为每个连接的入站事件缓冲区大小
    pub fn new(event_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                event_buffer: event_buffer.max(1),
                next_id: AtomicU64::new(1),
                connections: DashMap::new(),
                topics: DashMap::new(),
                fail_subscribe: AtomicBool::new(false),
                fail_publish: AtomicBool::new(false),
                fail_unsubscribe: AtomicBool::new(false),
            }),
        }
    }

    /// 中断所有连接：订阅关系丢失，随后投递 `Disconnected`
    pub async fn interrupt(&self) {
        let mut notify = Vec::new();
        for mut conn in self.inner.connections.iter_mut() {
            conn.online = false;
            notify.push((*conn.key(), conn.events.clone()));
        }
        for (id, sender) in notify {
            self.inner.drop_subscriptions(id);
            let _ = sender
                .send(GatewayEvent::Disconnected {
                    reason: "transport close".to_string(),
                })
                .await;
        }
    }

    /// 恢复所有中断的连接并投递 `Connected`
    pub async fn restore(&self) {
        let mut notify = Vec::new();
        for mut conn in self.inner.connections.iter_mut() {
            if !conn.online {
                conn.online = true;
                notify.push(conn.events.clone());
            }
        }
        for sender in notify {
            let _ = sender.send(GatewayEvent::Connected).await;
        }
    }

    /// 以网关身份直接向频道投递任意载荷
    pub async fn inject(&self, topic: &Topic, payload: Value) -> usize {
        self.inner.deliver(topic, payload).await
    }

    /// 至少有一个订阅者的频道（按名称排序）
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .inner
            .topics
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    /// 指定用户当前订阅的频道
    pub fn topics_for_user(&self, user_id: &str) -> Vec<String> {
        let ids: HashSet<u64> = self
            .inner
            .connections
            .iter()
            .filter(|conn| conn.user_id == user_id)
            .map(|conn| *conn.key())
            .collect();
        let mut topics: Vec<String> = self
            .inner
            .topics
            .iter()
            .filter(|entry| entry.value().iter().any(|id| ids.contains(id)))
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// 之后的订阅请求全部失败
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// 之后的发布请求全部失败
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// 之后的退订请求全部失败
    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.inner.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketGateway for LocalSocketGateway {
    async fn connect(&self, identity: &SessionIdentity) -> Result<GatewayConnection> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.event_buffer);
        let _ = tx.try_send(GatewayEvent::Connected);
        self.inner.connections.insert(
            id,
            LocalConnection {
                user_id: identity.user_id.clone(),
                events: tx,
                online: true,
            },
        );
        debug!(connection_id = id, user_id = %identity.user_id, "local connection opened");

        Ok(GatewayConnection {
            channel: Arc::new(LocalChannel {
                id,
                inner: self.inner.clone(),
            }),
            events: rx,
        })
    }
}

struct LocalChannel {
    id: u64,
    inner: Arc<Inner>,
}

#[async_trait]
impl LiveChannel for LocalChannel {
    async fn subscribe(&self, topic: &Topic) -> Result<()> {
        self.inner.ensure_online(self.id)?;
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(HubChatError::Transport(format!(
                "subscribe to {topic} rejected"
            )));
        }
        self.inner
            .topics
            .entry(topic.as_str().to_string())
            .or_default()
            .insert(self.id);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.inner.ensure_online(self.id)?;
        if self.inner.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(HubChatError::Transport(format!(
                "unsubscribe from {topic} rejected"
            )));
        }
        if let Some(mut ids) = self.inner.topics.get_mut(topic.as_str()) {
            ids.remove(&self.id);
        }
        self.inner
            .topics
            .remove_if(topic.as_str(), |_, ids| ids.is_empty());
        Ok(())
    }

    async fn publish(&self, topic: &Topic, payload: Value) -> Result<()> {
        self.inner.ensure_online(self.id)?;
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(HubChatError::Transport(format!(
                "publish to {topic} rejected"
            )));
        }
        let delivered = self.inner.deliver(topic, payload).await;
        trace!(topic = %topic, delivered, "local publish");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.connections.remove(&self.id);
        self.inner.drop_subscriptions(self.id);
        debug!(connection_id = self.id, "local connection closed");
        Ok(())
    }
}
