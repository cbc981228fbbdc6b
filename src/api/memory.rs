//! 进程内 REST 后端
//!
//! 行为与真实后端保持一致：列表包含全部群组（含待审核），
//! 新建群组处于待审核状态，持久化返回带服务端 ID 的存储记录。
//! 额外提供审核、失败注入与历史闸门，用于编排乱序完成的场景。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use super::{CreateGroupRequest, HubApi};
use crate::error::{HubChatError, Result};
use crate::model::{Group, GroupId, GroupStatus, Message, OutgoingMessage, SessionIdentity};

#[derive(Default)]
struct MemoryState {
    groups: RwLock<Vec<Group>>,
    messages: RwLock<HashMap<GroupId, Vec<Message>>>,
    /// 被扣住的历史请求，释放前 fetch 一直等待
    held_history: Mutex<HashMap<GroupId, watch::Sender<bool>>>,
    next_id: AtomicU64,
    fail_history: AtomicBool,
    fail_posts: AtomicBool,
    bare_post_ack: AtomicBool,
    history_requests: AtomicUsize,
    post_requests: AtomicUsize,
}

/// 进程内后端（克隆共享同一份数据）
#[derive(Clone, Default)]
pub struct MemoryHubApi {
    state: Arc<MemoryState>,
}

impl MemoryHubApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 添加一个已审核的群组
    pub fn add_group(&self, id: impl Into<GroupId>, name: impl Into<String>) -> GroupId {
        self.insert_group(id.into(), name.into(), GroupStatus::Approved)
    }

    /// 添加一个待审核的群组
    pub fn add_pending_group(&self, id: impl Into<GroupId>, name: impl Into<String>) -> GroupId {
        self.insert_group(id.into(), name.into(), GroupStatus::Pending)
    }

    fn insert_group(&self, id: GroupId, name: String, status: GroupStatus) -> GroupId {
        self.state.groups.write().push(Group {
            id: id.clone(),
            name,
            description: String::new(),
            created_by: None,
            creator_name: None,
            created_at: Some(Utc::now()),
            status,
        });
        id
    }

    /// 模拟管理员审核通过
    pub fn approve_group(&self, group_id: &GroupId) -> bool {
        self.set_group_status(group_id, GroupStatus::Approved)
    }

    /// 模拟管理员拒绝
    pub fn reject_group(&self, group_id: &GroupId) -> bool {
        self.set_group_status(group_id, GroupStatus::Rejected)
    }

    fn set_group_status(&self, group_id: &GroupId, status: GroupStatus) -> bool {
        let mut groups = self.state.groups.write();
        match groups.iter_mut().find(|g| &g.id == group_id) {
            Some(group) => {
                group.status = status;
                true
            }
            None => false,
        }
    }

    /// 直接写入一条已存储的消息，未带服务端 ID 时分配一个
    pub fn insert_message(&self, mut message: Message) -> Message {
        if message.message_id.is_none() {
            message.message_id = Some(format!("m-{}", self.next_id()));
        }
        self.state
            .messages
            .write()
            .entry(message.group_id.clone())
            .or_default()
            .push(message.clone());
        message
    }

    /// 群组中已存储的消息
    pub fn stored_messages(&self, group_id: &GroupId) -> Vec<Message> {
        self.state
            .messages
            .read()
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn groups_snapshot(&self) -> Vec<Group> {
        self.state.groups.read().clone()
    }

    /// 历史拉取全部失败
    pub fn fail_history(&self, fail: bool) {
        self.state.fail_history.store(fail, Ordering::SeqCst);
    }

    /// 消息持久化全部失败
    pub fn fail_posts(&self, fail: bool) {
        self.state.fail_posts.store(fail, Ordering::SeqCst);
    }

    /// 持久化只返回确认，不返回存储记录
    pub fn bare_post_ack(&self, bare: bool) {
        self.state.bare_post_ack.store(bare, Ordering::SeqCst);
    }

    /// 扣住指定群组的历史请求，直到 [`release_history`](Self::release_history)
    pub fn hold_history(&self, group_id: &GroupId) {
        let (tx, _rx) = watch::channel(false);
        self.state.held_history.lock().insert(group_id.clone(), tx);
    }

    /// 放行被扣住的历史请求
    pub fn release_history(&self, group_id: &GroupId) {
        if let Some(tx) = self.state.held_history.lock().remove(group_id) {
            let _ = tx.send(true);
        }
    }

    /// 已收到的历史请求数
    pub fn history_requests(&self) -> usize {
        self.state.history_requests.load(Ordering::SeqCst)
    }

    /// 已收到的持久化请求数
    pub fn post_requests(&self) -> usize {
        self.state.post_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HubApi for MemoryHubApi {
    async fn list_groups(&self) -> Result<Vec<Group>> {
        Ok(self.groups_snapshot())
    }

    async fn fetch_group_messages(&self, group_id: &GroupId) -> Result<Vec<Message>> {
        self.state.history_requests.fetch_add(1, Ordering::SeqCst);

        let gate = self
            .state
            .held_history
            .lock()
            .get(group_id)
            .map(|tx| tx.subscribe());
        if let Some(mut gate) = gate {
            debug!(group_id = %group_id, "history request held");
            // 发送端被丢弃同样视为放行
            let _ = gate.wait_for(|released| *released).await;
        }

        if self.state.fail_history.load(Ordering::SeqCst) {
            return Err(HubChatError::Api {
                status: 503,
                body: "history unavailable".to_string(),
            });
        }
        Ok(self.stored_messages(group_id))
    }

    async fn post_group_message(&self, draft: &OutgoingMessage) -> Result<Option<Message>> {
        self.state.post_requests.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_posts.load(Ordering::SeqCst) {
            return Err(HubChatError::Api {
                status: 500,
                body: "failed to store message".to_string(),
            });
        }

        let known = self
            .state
            .groups
            .read()
            .iter()
            .any(|g| g.id == draft.group_id);
        if !known {
            return Err(HubChatError::Api {
                status: 404,
                body: format!("group {} not found", draft.group_id),
            });
        }

        let mut stored = draft.to_message();
        stored.created_at = Utc::now();
        let stored = self.insert_message(stored);

        if self.state.bare_post_ack.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(stored))
        }
    }

    async fn create_group(
        &self,
        request: &CreateGroupRequest,
        creator: &SessionIdentity,
    ) -> Result<Group> {
        let group = Group {
            id: GroupId::new(format!("g-{}", self.next_id())),
            name: request.name.clone(),
            description: request.description.clone(),
            created_by: Some(creator.user_id.clone()),
            creator_name: Some(creator.display_name.clone()),
            created_at: Some(Utc::now()),
            status: GroupStatus::Pending,
        };
        self.state.groups.write().push(group.clone());
        Ok(group)
    }
}
