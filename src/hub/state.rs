//! 群聊同步状态机
//!
//! 纯同步的状态容器，由离散事件驱动：切换群组、历史拉取完成、实时事件、发送结算、连接变化。
//! 不做任何 I/O，事件循环执行它返回的计划并把结果回灌进来。
//!
//! 每次切换群组都会签发新的 [`FetchTicket`]，只有与当前票据一致的历史结果才会被合并，
//! 迟到的旧群组历史被丢弃。

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::directory::GroupDirectory;
use super::membership::{ChannelMembership, SwitchPlan};
use super::send::SendPipeline;
use crate::config::HubChatConfig;
use crate::error::{HubChatError, Result};
use crate::metrics::drop_reason;
use crate::model::wire::NEW_GROUP_MESSAGE;
use crate::model::{Group, GroupId, Message, OutgoingMessage, SessionIdentity, WireMessage};
use crate::timeline::{MergeOutcome, MergeStats, TimelineEntry, TimelineStore, overdue_entries};
use crate::transport::Topic;

/// 历史拉取票据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub group_id: GroupId,
    pub generation: u64,
}

/// 时间线状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TimelineStatus {
    /// 没有激活的群组
    Idle,
    /// 等待历史与订阅完成
    Loading,
    Ready,
    /// 历史拉取失败，重新进入群组时重试
    Unavailable { reason: String },
    /// 群组不在已知列表中
    UnknownGroup { group_id: GroupId },
}

/// 对外的只读视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineView {
    pub group_id: Option<GroupId>,
    pub status: TimelineStatus,
    /// 是否已订阅实时频道（false 表示仅历史模式）
    pub live: bool,
    pub entries: Vec<TimelineEntry>,
}

impl TimelineView {
    fn idle() -> Self {
        Self {
            group_id: None,
            status: TimelineStatus::Idle,
            live: false,
            entries: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == TimelineStatus::Ready
    }

    pub fn contents(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.message.content.as_str())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    /// 超时未确认的乐观条目，供界面提供重试入口
    pub fn overdue_pending(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<&TimelineEntry> {
        overdue_entries(&self.entries, now, threshold)
    }
}

/// 切换群组后事件循环需要执行的动作
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    pub channel: SwitchPlan,
    pub fetch: Option<FetchTicket>,
}

/// 历史结果的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Merged(MergeStats),
    Failed,
    /// 票据已过期
    Stale,
}

/// 实时事件的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Merged(MergeOutcome),
    Dropped(&'static str),
}

pub struct HubState {
    identity: SessionIdentity,
    directory: GroupDirectory,
    membership: ChannelMembership,
    store: TimelineStore,
    active: Option<GroupId>,
    status: TimelineStatus,
    ticket: Option<FetchTicket>,
    generation: u64,
    history_settled: bool,
    subscribe_settled: bool,
    overdue_after: Duration,
}

impl HubState {
    pub fn new(identity: SessionIdentity, config: &HubChatConfig) -> Self {
        Self {
            identity,
            directory: GroupDirectory::default(),
            membership: ChannelMembership::new(config.gateway.topic_prefix.clone()),
            store: TimelineStore::new(
                config.timeline.cache_capacity,
                config.timeline.dedup_window_ms,
            ),
            active: None,
            status: TimelineStatus::Idle,
            ticket: None,
            generation: 0,
            history_settled: false,
            subscribe_settled: false,
            overdue_after: Duration::milliseconds(config.send.pending_overdue_ms),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn active_group(&self) -> Option<&GroupId> {
        self.active.as_ref()
    }

    pub fn status(&self) -> &TimelineStatus {
        &self.status
    }

    pub fn membership(&self) -> &ChannelMembership {
        &self.membership
    }

    pub fn groups(&self) -> &[Group] {
        self.directory.groups()
    }

    pub fn overdue_after(&self) -> Duration {
        self.overdue_after
    }

    /// 切换当前群组
    ///
    /// - `None`：退订并清空可见时间线（缓存保留）
    /// - 未知群组：退订当前频道，呈现空的 `UnknownGroup` 状态，不订阅也不拉取
    /// - 已知群组：签发新票据，必要时切换频道；重新进入同一群组会重新拉取历史并重试订阅
    pub fn activate(&mut self, target: Option<GroupId>) -> Activation {
        self.generation += 1;
        self.ticket = None;
        self.history_settled = false;
        self.subscribe_settled = false;

        let Some(group_id) = target else {
            self.active = None;
            self.status = TimelineStatus::Idle;
            return Activation {
                channel: self.membership.switch_to(None),
                fetch: None,
            };
        };

        if !self.directory.contains(&group_id) {
            warn!(group_id = %group_id, "requested group is not in the known group list");
            self.active = None;
            self.status = TimelineStatus::UnknownGroup { group_id };
            return Activation {
                channel: self.membership.switch_to(None),
                fetch: None,
            };
        }

        self.store.open(&group_id);
        let channel = self.membership.switch_to(Some(group_id.clone()));
        // 已订阅同一频道时无需等待订阅结果
        self.subscribe_settled = channel.subscribe.is_none() && self.membership.is_live();
        let ticket = FetchTicket {
            group_id: group_id.clone(),
            generation: self.generation,
        };
        self.ticket = Some(ticket.clone());
        self.active = Some(group_id);
        self.status = TimelineStatus::Loading;

        debug!(generation = self.generation, "active group switched");
        Activation {
            channel,
            fetch: Some(ticket),
        }
    }

    /// 退订结果；失败时同样视为已退订（非当前群组的事件会被过滤）
    pub fn on_unsubscribed(&mut self, topic: &Topic, result: &Result<()>) {
        if let Err(e) = result {
            warn!(topic = %topic, error = %e, "unsubscribe failed");
        }
    }

    /// 订阅结果；失败时进入仅历史模式
    pub fn on_subscribed(&mut self, topic: &Topic, result: &Result<()>) {
        self.membership.on_subscribed(topic, result.is_ok());
        if let Err(e) = result {
            warn!(topic = %topic, error = %e, "subscribe failed, timeline continues in history-only mode");
        }

        let for_active = self
            .active
            .as_ref()
            .is_some_and(|id| self.membership.topic_for(id) == *topic);
        if for_active {
            self.subscribe_settled = true;
            self.refresh_readiness();
        }
    }

    /// 合并历史结果
    pub fn on_history(
        &mut self,
        ticket: &FetchTicket,
        result: Result<Vec<Message>>,
    ) -> HistoryOutcome {
        if self.ticket.as_ref() != Some(ticket) {
            debug!(
                group_id = %ticket.group_id,
                generation = ticket.generation,
                "discarding stale history response"
            );
            return HistoryOutcome::Stale;
        }
        self.history_settled = true;
        let timeline = self.store.open(&ticket.group_id);

        match result {
            Ok(messages) => {
                let stats = timeline.load_history(messages);
                debug!(
                    group_id = %ticket.group_id,
                    inserted = stats.inserted,
                    collapsed = stats.collapsed,
                    confirmed = stats.confirmed,
                    "history merged"
                );
                if matches!(self.status, TimelineStatus::Unavailable { .. }) {
                    self.status = TimelineStatus::Loading;
                }
                self.refresh_readiness();
                HistoryOutcome::Merged(stats)
            }
            Err(e) if self.status == TimelineStatus::Ready => {
                // 后台刷新失败不影响已展示的时间线
                warn!(group_id = %ticket.group_id, error = %e, "history refresh failed");
                HistoryOutcome::Failed
            }
            Err(e) => {
                warn!(group_id = %ticket.group_id, error = %e, "history fetch failed");
                timeline.retain_pending();
                self.status = TimelineStatus::Unavailable {
                    reason: e.to_string(),
                };
                HistoryOutcome::Failed
            }
        }
    }

    fn refresh_readiness(&mut self) {
        if self.status == TimelineStatus::Loading && self.history_settled && self.subscribe_settled {
            self.status = TimelineStatus::Ready;
            if let Some(group_id) = &self.active {
                info!(group_id = %group_id, live = self.membership.is_live(), "timeline ready");
            }
        }
    }

    /// 处理实时事件；不属于当前群组或载荷不完整的事件被丢弃
    pub fn on_live(&mut self, topic: &Topic, payload: Value) -> LiveOutcome {
        let Some(topic_group) = self.membership.group_of(topic) else {
            return LiveOutcome::Dropped(drop_reason::UNKNOWN_TOPIC);
        };
        let Some(active) = self.active.clone() else {
            return LiveOutcome::Dropped(drop_reason::INACTIVE_GROUP);
        };
        if topic_group != active {
            debug!(topic = %topic, "dropping live event for inactive group");
            return LiveOutcome::Dropped(drop_reason::INACTIVE_GROUP);
        }

        let wire = match WireMessage::from_value(payload) {
            Ok(wire) => wire,
            Err(e) => {
                debug!(topic = %topic, error = %e, "dropping malformed live event");
                return LiveOutcome::Dropped(drop_reason::MALFORMED);
            }
        };
        if wire.kind.as_deref().is_some_and(|kind| kind != NEW_GROUP_MESSAGE) {
            return LiveOutcome::Dropped(drop_reason::UNSUPPORTED_TYPE);
        }
        let message = match wire.into_message(Some(&active)) {
            Ok(message) => message,
            Err(e) => {
                debug!(topic = %topic, error = %e, "dropping malformed live event");
                return LiveOutcome::Dropped(drop_reason::MALFORMED);
            }
        };
        if message.group_id != active {
            return LiveOutcome::Dropped(drop_reason::INACTIVE_GROUP);
        }

        LiveOutcome::Merged(self.store.open(&active).append_live(message))
    }

    /// 校验并写入乐观条目，返回待发送草稿
    pub fn begin_send(&mut self, content: &str) -> Result<OutgoingMessage> {
        let content = SendPipeline::prepare(content)?;
        let group_id = self.active.clone().ok_or(HubChatError::NoActiveGroup)?;
        let draft = OutgoingMessage::new(group_id.clone(), &self.identity, content);
        self.store.open(&group_id).append_optimistic(draft.to_message());
        debug!(group_id = %group_id, client_msg_id = %draft.client_msg_id, "optimistic entry added");
        Ok(draft)
    }

    /// 发送结算；草稿所属群组已被淘汰出缓存时返回 None
    pub fn on_send_settled(
        &mut self,
        draft: &OutgoingMessage,
        persisted: &Result<Option<Message>>,
    ) -> Option<MergeOutcome> {
        let timeline = self.store.get_mut(&draft.group_id)?;
        match persisted {
            Ok(record) => Some(timeline.confirm_persisted(&draft.client_msg_id, record.clone())),
            Err(e) => {
                timeline.mark_send_failed(&draft.client_msg_id, e.to_string());
                None
            }
        }
    }

    /// 连接中断
    pub fn on_connection_lost(&mut self) {
        self.membership.on_connection_lost();
    }

    /// 连接恢复：返回需要补订阅的频道与补拉历史的票据
    pub fn on_connection_restored(&mut self) -> Activation {
        let Some(topic) = self.membership.pending_subscription() else {
            return Activation::default();
        };
        let fetch = self.active.clone().map(|group_id| {
            self.generation += 1;
            let ticket = FetchTicket {
                group_id,
                generation: self.generation,
            };
            self.ticket = Some(ticket.clone());
            ticket
        });
        Activation {
            channel: SwitchPlan {
                unsubscribe: None,
                subscribe: Some(topic),
            },
            fetch,
        }
    }

    /// 更新群组目录；尚无激活群组时返回应自动选中的第一个群组
    pub fn on_groups_loaded(&mut self, groups: Vec<Group>) -> Option<GroupId> {
        let visible = self.directory.replace(groups);
        debug!(visible, "group directory refreshed");
        if self.active.is_none() && !matches!(self.status, TimelineStatus::UnknownGroup { .. }) {
            self.directory.first().cloned()
        } else {
            None
        }
    }

    /// 登出：返回需要退订的频道
    pub fn release(&mut self) -> Option<Topic> {
        self.active = None;
        self.ticket = None;
        self.status = TimelineStatus::Idle;
        self.store.clear();
        self.membership.release()
    }

    /// 当前视图
    pub fn view(&self) -> TimelineView {
        let Some(group_id) = &self.active else {
            return TimelineView {
                status: self.status.clone(),
                ..TimelineView::idle()
            };
        };
        TimelineView {
            group_id: Some(group_id.clone()),
            status: self.status.clone(),
            live: self.membership.is_live(),
            entries: self
                .store
                .get(group_id)
                .map(|t| t.entries().to_vec())
                .unwrap_or_default(),
        }
    }
}
