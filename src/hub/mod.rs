//! 群聊客户端
//!
//! [`HubClient`] 是对外句柄，全部状态由单个事件循环任务独占：
//! - 命令（切换群组、发送、刷新群组、建群、关闭）经 mpsc 串行进入循环
//! - 历史拉取、发送、群组请求在独立任务中执行，结果作为内部事件回灌
//! - 网关事件（实时消息与连接变化）直接进入循环
//!
//! 状态变更只发生在循环内，因此不需要锁；异步完成之间的先后由时间线合并规则与拉取票据处理。
//! 每处理一个事件就通过 `watch` 通道发布新的 [`TimelineView`]。

pub mod directory;
pub mod membership;
pub mod send;
pub mod state;

pub use directory::GroupDirectory;
pub use membership::{ChannelMembership, SwitchPlan};
pub use send::{SendPipeline, SendReceipt};
pub use state::{FetchTicket, HubState, TimelineStatus, TimelineView};

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::send::Dispatched;
use self::state::{Activation, HistoryOutcome, LiveOutcome};
use crate::api::HubApi;
use crate::config::HubChatConfig;
use crate::error::{HubChatError, Result};
use crate::metrics::ChatMetrics;
use crate::model::{Group, GroupId, Message, OutgoingMessage, SessionIdentity};
use crate::timeline::{MergeOutcome, TimelineEntry};
use crate::transport::{GatewayEvent, SocketGateway, TransportSession};

const COMMAND_BUFFER: usize = 64;

enum Command {
    SetActiveGroup {
        group_id: Option<GroupId>,
        reply: oneshot::Sender<TimelineView>,
    },
    Send {
        content: String,
        reply: oneshot::Sender<Result<SendReceipt>>,
    },
    RefreshGroups {
        reply: oneshot::Sender<Result<Vec<Group>>>,
    },
    CreateGroup {
        name: String,
        description: String,
        reply: oneshot::Sender<Result<Group>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// 后台任务完成后回灌的事件
enum HubEvent {
    HistoryLoaded {
        ticket: FetchTicket,
        result: Result<Vec<Message>>,
    },
    SendSettled {
        draft: OutgoingMessage,
        dispatched: Dispatched,
        reply: oneshot::Sender<Result<SendReceipt>>,
    },
    GroupsLoaded {
        result: Result<Vec<Group>>,
        reply: Option<oneshot::Sender<Result<Vec<Group>>>>,
    },
    GroupCreated {
        result: Result<Group>,
        reply: oneshot::Sender<Result<Group>>,
    },
}

/// 群聊客户端句柄
pub struct HubClient {
    commands: mpsc::Sender<Command>,
    timeline: watch::Receiver<TimelineView>,
    groups: watch::Receiver<Vec<Group>>,
    metrics: Arc<ChatMetrics>,
    overdue_after: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HubClient {
    /// 建立传输会话、加载群组目录并启动事件循环
    ///
    /// 目录非空时自动选中第一个群组。
    pub async fn start(
        config: &HubChatConfig,
        identity: SessionIdentity,
        api: Arc<dyn HubApi>,
        gateway: Arc<dyn SocketGateway>,
    ) -> Result<Self> {
        let metrics = Arc::new(ChatMetrics::new().map_err(anyhow::Error::from)?);
        let mut session = TransportSession::new(gateway, identity.clone());
        let gateway_events = session.connect().await?;

        let mut state = HubState::new(identity, config);
        let initial = match api.list_groups().await {
            Ok(groups) => state.on_groups_loaded(groups),
            Err(e) => {
                warn!(error = %e, "initial group list unavailable");
                None
            }
        };
        let overdue_after = state.overdue_after();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::channel(config.gateway.event_buffer);
        let (timeline_tx, timeline_rx) = watch::channel(state.view());
        let (groups_tx, groups_rx) = watch::channel(state.groups().to_vec());

        let worker = HubWorker {
            state,
            session,
            api,
            metrics: metrics.clone(),
            internal_tx,
            timeline_tx,
            groups_tx,
        };
        let task = tokio::spawn(worker.run(command_rx, internal_rx, gateway_events, initial));
        info!("hub client started");

        Ok(Self {
            commands: command_tx,
            timeline: timeline_rx,
            groups: groups_rx,
            metrics,
            overdue_after,
            task: Mutex::new(Some(task)),
        })
    }

    async fn request<T>(&self, command: Command, reply: oneshot::Receiver<T>) -> Result<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubChatError::ClientClosed)?;
        reply.await.map_err(|_| HubChatError::ClientClosed)
    }

    /// 切换当前群组，`None` 表示不查看任何群组
    ///
    /// 返回切换后的视图；历史在后台加载，可用 [`wait_for_timeline`](Self::wait_for_timeline) 等待就绪。
    pub async fn set_active_group(&self, group_id: Option<GroupId>) -> Result<TimelineView> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetActiveGroup { group_id, reply }, rx)
            .await
    }

    /// 向当前群组发送消息
    ///
    /// 乐观条目在持久化之前就已出现在时间线中；持久化失败时返回错误，条目保持待确认。
    pub async fn send(&self, content: impl Into<String>) -> Result<SendReceipt> {
        let (reply, rx) = oneshot::channel();
        let content = content.into();
        self.request(Command::Send { content, reply }, rx).await?
    }

    /// 当前时间线视图
    pub fn timeline(&self) -> TimelineView {
        self.timeline.borrow().clone()
    }

    pub fn watch_timeline(&self) -> watch::Receiver<TimelineView> {
        self.timeline.clone()
    }

    /// 等待视图满足条件
    pub async fn wait_for_timeline<F>(&self, predicate: F) -> Result<TimelineView>
    where
        F: FnMut(&TimelineView) -> bool,
    {
        let mut rx = self.timeline.clone();
        let view = rx
            .wait_for(predicate)
            .await
            .map_err(|_| HubChatError::ClientClosed)?;
        Ok(view.clone())
    }

    /// 超时未确认的乐观条目
    pub fn overdue_pending(&self) -> Vec<TimelineEntry> {
        self.timeline
            .borrow()
            .overdue_pending(Utc::now(), self.overdue_after)
            .into_iter()
            .cloned()
            .collect()
    }

    /// 可见群组（已审核）
    pub fn groups(&self) -> Vec<Group> {
        self.groups.borrow().clone()
    }

    pub async fn refresh_groups(&self) -> Result<Vec<Group>> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::RefreshGroups { reply }, rx).await?
    }

    /// 创建群组（仅认证用户），新群组审核通过前不可见
    pub async fn create_group(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Group> {
        let (reply, rx) = oneshot::channel();
        let command = Command::CreateGroup {
            name: name.into(),
            description: description.into(),
            reply,
        };
        self.request(command, rx).await?
    }

    pub fn metrics(&self) -> Arc<ChatMetrics> {
        self.metrics.clone()
    }

    /// 登出：退订频道、断开会话并结束事件循环（幂等）
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(anyhow::Error::from)?;
        }
        Ok(())
    }
}

struct HubWorker {
    state: HubState,
    session: TransportSession,
    api: Arc<dyn HubApi>,
    metrics: Arc<ChatMetrics>,
    internal_tx: mpsc::Sender<HubEvent>,
    timeline_tx: watch::Sender<TimelineView>,
    groups_tx: watch::Sender<Vec<Group>>,
}

impl HubWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<HubEvent>,
        gateway_events: mpsc::Receiver<GatewayEvent>,
        initial: Option<GroupId>,
    ) {
        let mut gateway_events = Some(gateway_events);
        if initial.is_some() {
            self.activate(initial).await;
            self.publish_view();
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all hub client handles dropped");
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_event(event).await,
                event = next_gateway_event(&mut gateway_events), if gateway_events.is_some() => {
                    match event {
                        Some(event) => self.handle_gateway_event(event).await,
                        None => {
                            warn!("gateway event stream closed");
                            gateway_events = None;
                            self.session.on_gateway_event(&GatewayEvent::Disconnected {
                                reason: "event stream closed".to_string(),
                            });
                            self.state.on_connection_lost();
                        }
                    }
                }
            }
            self.publish_view();
        }
        info!("hub client stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetActiveGroup { group_id, reply } => {
                self.activate(group_id).await;
                self.publish_view();
                let _ = reply.send(self.state.view());
            }
            Command::Send { content, reply } => match self.state.begin_send(&content) {
                Ok(draft) => {
                    // 乐观条目先对外可见
                    self.publish_view();
                    self.spawn_send(draft, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::RefreshGroups { reply } => self.spawn_group_refresh(Some(reply)),
            Command::CreateGroup {
                name,
                description,
                reply,
            } => match GroupDirectory::prepare_create(self.state.identity(), &name, &description) {
                Ok(request) => {
                    let api = self.api.clone();
                    let identity = self.state.identity().clone();
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let result = api.create_group(&request, &identity).await;
                        let _ = tx.send(HubEvent::GroupCreated { result, reply }).await;
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Shutdown { .. } => {}
        }
    }

    async fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::HistoryLoaded { ticket, result } => {
                match self.state.on_history(&ticket, result) {
                    HistoryOutcome::Merged(stats) => {
                        self.metrics.duplicates_collapsed.inc_by(stats.collapsed as u64);
                        self.metrics.optimistic_confirmed.inc_by(stats.confirmed as u64);
                    }
                    HistoryOutcome::Failed => self.metrics.history_fetch_failures.inc(),
                    HistoryOutcome::Stale => self.metrics.stale_history_discarded.inc(),
                }
            }
            HubEvent::SendSettled {
                draft,
                dispatched,
                reply,
            } => {
                let outcome = self.state.on_send_settled(&draft, &dispatched.persisted);
                if outcome == Some(MergeOutcome::Confirmed) {
                    self.metrics.optimistic_confirmed.inc();
                }
                if dispatched.persisted.is_err() {
                    self.metrics.send_failures.inc();
                }
                if dispatched.broadcast.is_err() {
                    self.metrics.broadcast_failures.inc();
                }
                // 调用方拿到回执时视图已包含结算结果
                self.publish_view();
                let _ = reply.send(dispatched.into_receipt(&draft));
            }
            HubEvent::GroupsLoaded { result, reply } => match result {
                Ok(groups) => {
                    let auto_select = self.state.on_groups_loaded(groups);
                    let visible = self.state.groups().to_vec();
                    self.groups_tx.send_replace(visible.clone());
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(visible));
                    }
                    if auto_select.is_some() {
                        self.activate(auto_select).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "group list refresh failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                }
            },
            HubEvent::GroupCreated { result, reply } => {
                if let Ok(group) = &result {
                    info!(group_id = %group.id, "group created, pending approval");
                    self.spawn_group_refresh(None);
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Delivered { topic, payload } => {
                self.metrics.live_events_received.inc();
                match self.state.on_live(&topic, payload) {
                    LiveOutcome::Merged(MergeOutcome::Inserted) => {}
                    LiveOutcome::Merged(MergeOutcome::Collapsed) => {
                        self.metrics.duplicates_collapsed.inc()
                    }
                    LiveOutcome::Merged(MergeOutcome::Confirmed) => {
                        self.metrics.optimistic_confirmed.inc()
                    }
                    LiveOutcome::Dropped(reason) => self.metrics.record_dropped(reason),
                }
            }
            event => {
                let recovered = self.session.on_gateway_event(&event);
                if matches!(event, GatewayEvent::Disconnected { .. }) {
                    self.state.on_connection_lost();
                }
                if recovered {
                    let activation = self.state.on_connection_restored();
                    self.apply(activation).await;
                }
            }
        }
    }

    async fn activate(&mut self, target: Option<GroupId>) {
        let activation = self.state.activate(target);
        self.apply(activation).await;
    }

    /// 执行状态机给出的计划：先发起历史拉取，再依次退订、订阅
    async fn apply(&mut self, activation: Activation) {
        if let Some(ticket) = activation.fetch {
            self.spawn_history(ticket);
        }
        if let Some(topic) = activation.channel.unsubscribe {
            let result = self.session.unsubscribe(&topic).await;
            self.state.on_unsubscribed(&topic, &result);
        }
        if let Some(topic) = activation.channel.subscribe {
            let result = self.session.subscribe(&topic).await;
            if result.is_err() {
                self.metrics.subscribe_failures.inc();
            }
            self.state.on_subscribed(&topic, &result);
        }
    }

    fn spawn_history(&self, ticket: FetchTicket) {
        let api = self.api.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_group_messages(&ticket.group_id).await;
            let _ = tx.send(HubEvent::HistoryLoaded { ticket, result }).await;
        });
    }

    fn spawn_send(&self, draft: OutgoingMessage, reply: oneshot::Sender<Result<SendReceipt>>) {
        let api = self.api.clone();
        let channel = self.session.channel();
        let topic = self.state.membership().topic_for(&draft.group_id);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let dispatched = SendPipeline::dispatch(api, channel, topic, &draft).await;
            let _ = tx
                .send(HubEvent::SendSettled {
                    draft,
                    dispatched,
                    reply,
                })
                .await;
        });
    }

    fn spawn_group_refresh(&self, reply: Option<oneshot::Sender<Result<Vec<Group>>>>) {
        let api = self.api.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = api.list_groups().await;
            let _ = tx.send(HubEvent::GroupsLoaded { result, reply }).await;
        });
    }

    async fn teardown(&mut self) {
        if let Some(topic) = self.state.release() {
            if let Err(e) = self.session.unsubscribe(&topic).await {
                debug!(topic = %topic, error = %e, "unsubscribe during shutdown failed");
            }
        }
        self.session.disconnect().await;
        self.publish_view();
    }

    fn publish_view(&self) {
        let view = self.state.view();
        self.metrics
            .observe_timeline(view.entries.len(), view.pending_count());
        self.timeline_tx.send_replace(view);
    }
}

async fn next_gateway_event(
    events: &mut Option<mpsc::Receiver<GatewayEvent>>,
) -> Option<GatewayEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
