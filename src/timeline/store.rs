//! 按群组 ID 索引的时间线容器
//!
//! 尽力而为的内存缓存：用户切回某个群组时先展示缓存条目，
//! 历史重新拉取后按去重身份合并。超过容量时淘汰最久未访问的群组。

use std::collections::{HashMap, VecDeque};

use crate::model::GroupId;

use super::Timeline;

pub struct TimelineStore {
    timelines: HashMap<GroupId, Timeline>,
    /// 访问顺序，队尾为最近访问
    recency: VecDeque<GroupId>,
    capacity: usize,
    dedup_window_ms: i64,
}

impl TimelineStore {
    pub fn new(capacity: usize, dedup_window_ms: i64) -> Self {
        Self {
            timelines: HashMap::new(),
            recency: VecDeque::new(),
            capacity: capacity.max(1),
            dedup_window_ms,
        }
    }

    pub fn get(&self, group_id: &GroupId) -> Option<&Timeline> {
        self.timelines.get(group_id)
    }

    pub fn get_mut(&mut self, group_id: &GroupId) -> Option<&mut Timeline> {
        self.timelines.get_mut(group_id)
    }

    /// 取出或创建群组时间线，并标记为最近访问
    pub fn open(&mut self, group_id: &GroupId) -> &mut Timeline {
        self.touch(group_id);
        if !self.timelines.contains_key(group_id) {
            self.evict_for_insert();
        }
        let window = self.dedup_window_ms;
        self.timelines
            .entry(group_id.clone())
            .or_insert_with(|| Timeline::new(window))
    }

    pub fn contains(&self, group_id: &GroupId) -> bool {
        self.timelines.contains_key(group_id)
    }

    pub fn len(&self) -> usize {
        self.timelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timelines.is_empty()
    }

    pub fn clear(&mut self) {
        self.timelines.clear();
        self.recency.clear();
    }

    fn touch(&mut self, group_id: &GroupId) {
        if let Some(pos) = self.recency.iter().position(|id| id == group_id) {
            self.recency.remove(pos);
        }
        self.recency.push_back(group_id.clone());
    }

    fn evict_for_insert(&mut self) {
        while self.timelines.len() >= self.capacity {
            // 队尾是刚被 touch 的目标群组，不参与淘汰
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            if self.recency.is_empty() {
                self.recency.push_back(oldest);
                break;
            }
            if self.timelines.remove(&oldest).is_some() {
                tracing::debug!(group_id = %oldest, "evicted cached timeline");
            }
        }
    }
}
