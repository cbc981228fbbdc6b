//! 消息时间线
//!
//! 纯状态的合并/去重 reducer，不依赖传输层与渲染层：
//! - `load_history`：以服务端快照播种或合并
//! - `append_live`：实时事件追加，命中去重身份时就地更新
//! - `append_optimistic`：本地乐观条目，等待回显确认
//!
//! 不变量：条目按 `(created_at, arrival)` 升序排列，时间戳相同时按进入时间线的先后。
//! 任意顺序交错调用上述操作，同一逻辑消息只保留一个条目。

pub mod store;

pub use store::TimelineStore;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::{DeliveryState, Message};
use crate::utils::millis_between;

/// 时间线条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    pub message: Message,
    pub state: DeliveryState,
    /// 最近一次持久化失败的原因（条目仍保持 Pending）
    pub send_error: Option<String>,
    #[serde(skip)]
    arrival: u64,
}

impl TimelineEntry {
    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }

    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.message.created_at, self.arrival)
    }
}

/// 单次合并的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 新条目
    Inserted,
    /// 与已有条目合并，状态未变
    Collapsed,
    /// 与已有的 Pending 条目合并并提升为 Confirmed
    Confirmed,
}

/// 批量合并统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub collapsed: usize,
    pub confirmed: usize,
}

impl MergeStats {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Collapsed => self.collapsed += 1,
            MergeOutcome::Confirmed => self.confirmed += 1,
        }
    }
}

/// 超过阈值仍为 Pending 的条目
pub fn overdue_entries(
    entries: &[TimelineEntry],
    now: DateTime<Utc>,
    threshold: Duration,
) -> Vec<&TimelineEntry> {
    entries
        .iter()
        .filter(|e| e.is_pending() && now - e.message.created_at > threshold)
        .collect()
}

/// 单个群组的有序去重消息序列
#[derive(Debug, Clone)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    next_arrival: u64,
    dedup_window_ms: i64,
}

impl Timeline {
    pub fn new(dedup_window_ms: i64) -> Self {
        Self {
            entries: Vec::new(),
            next_arrival: 0,
            dedup_window_ms,
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 以历史快照播种或合并
    ///
    /// 快照先按创建时间排序再逐条合并，因此与先到的实时事件可交换。
    pub fn load_history(&mut self, mut messages: Vec<Message>) -> MergeStats {
        messages.sort_by_key(|m| m.created_at);
        let mut stats = MergeStats::default();
        for message in messages {
            stats.record(self.upsert(message, DeliveryState::Confirmed));
        }
        stats
    }

    /// 追加实时事件
    pub fn append_live(&mut self, message: Message) -> MergeOutcome {
        self.upsert(message, DeliveryState::Confirmed)
    }

    /// 追加本地乐观条目
    ///
    /// 若回显已先到达，合并到已确认条目上，不会降级为 Pending。
    pub fn append_optimistic(&mut self, message: Message) -> MergeOutcome {
        self.upsert(message, DeliveryState::Pending)
    }

    /// 持久化成功
    ///
    /// 服务端返回了存储记录时按记录确认；否则只清除失败标记，等待回显或下次历史拉取。
    pub fn confirm_persisted(&mut self, client_msg_id: &str, record: Option<Message>) -> MergeOutcome {
        if let Some(idx) = self.position_by_client_id(client_msg_id) {
            self.entries[idx].send_error = None;
        }
        match record {
            Some(mut record) => {
                if record.client_msg_id.is_none() {
                    record.client_msg_id = Some(client_msg_id.to_string());
                }
                self.upsert(record, DeliveryState::Confirmed)
            }
            None => MergeOutcome::Collapsed,
        }
    }

    /// 持久化失败：条目保留且保持原状态，只记录失败原因
    pub fn mark_send_failed(&mut self, client_msg_id: &str, error: impl Into<String>) -> bool {
        match self.position_by_client_id(client_msg_id) {
            Some(idx) => {
                self.entries[idx].send_error = Some(error.into());
                true
            }
            None => false,
        }
    }

    /// 超过阈值仍未确认的乐观条目（供界面提供重试入口，不做回滚）
    pub fn overdue_pending(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<&TimelineEntry> {
        overdue_entries(&self.entries, now, threshold)
    }

    /// 历史拉取失败：丢弃已确认条目，保留乐观条目
    pub fn retain_pending(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.is_pending());
        before - self.entries.len()
    }

    fn position_by_client_id(&self, client_msg_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.client_msg_id.as_deref() == Some(client_msg_id))
    }

    /// 查找同一逻辑消息的已有条目
    ///
    /// 服务端 ID、客户端关联 ID 精确命中优先；否则在时间窗口内取时间差最小的候选，
    /// 时间差相同时取先进入时间线的条目，保证结果与到达顺序无关。
    fn find_match(&self, message: &Message) -> Option<usize> {
        let key = message.dedup_key();
        let window = self.dedup_window_ms;

        if let Some(id) = key.message_id {
            let exact = self.entries.iter().position(|e| {
                e.message.message_id.as_deref() == Some(id)
                    && e.message.dedup_key().matches(&key, window)
            });
            if exact.is_some() {
                return exact;
            }
        }
        if let Some(id) = key.client_msg_id {
            let exact = self.entries.iter().position(|e| {
                e.message.client_msg_id.as_deref() == Some(id)
                    && e.message.dedup_key().matches(&key, window)
            });
            if exact.is_some() {
                return exact;
            }
        }

        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.message.dedup_key().matches(&key, window))
            .min_by_key(|(_, e)| (millis_between(&e.message.created_at, &key.created_at), e.arrival))
            .map(|(idx, _)| idx)
    }

    fn upsert(&mut self, message: Message, state: DeliveryState) -> MergeOutcome {
        let Some(idx) = self.find_match(&message) else {
            let entry = TimelineEntry {
                message,
                state,
                send_error: None,
                arrival: self.next_arrival,
            };
            self.next_arrival += 1;
            self.insert_ordered(entry);
            return MergeOutcome::Inserted;
        };

        let entry = &mut self.entries[idx];
        let moved = entry.message.absorb(message);
        let outcome = if entry.is_pending() && state == DeliveryState::Confirmed {
            entry.state = DeliveryState::Confirmed;
            entry.send_error = None;
            MergeOutcome::Confirmed
        } else {
            MergeOutcome::Collapsed
        };

        if moved {
            let entry = self.entries.remove(idx);
            self.insert_ordered(entry);
        }
        outcome
    }

    fn insert_ordered(&mut self, entry: TimelineEntry) {
        let key = entry.sort_key();
        let at = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(at, entry);
    }
}
