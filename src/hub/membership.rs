//! 频道成员关系
//!
//! 把当前查看的群组映射为会话订阅的唯一频道。切换群组时先退订旧频道再订阅新频道；
//! 订阅失败不改变目标群组，便于之后重试。

use crate::model::GroupId;
use crate::transport::Topic;

/// 一次切换需要执行的频道操作
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchPlan {
    pub unsubscribe: Option<Topic>,
    pub subscribe: Option<Topic>,
}

#[derive(Debug, Clone)]
pub struct ChannelMembership {
    topic_prefix: String,
    /// 期望订阅的群组
    intended: Option<GroupId>,
    /// 确认已订阅的频道
    subscribed: Option<Topic>,
}

impl ChannelMembership {
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            intended: None,
            subscribed: None,
        }
    }

    pub fn topic_for(&self, group_id: &GroupId) -> Topic {
        Topic::for_group(&self.topic_prefix, group_id)
    }

    /// 频道对应的群组
    pub fn group_of(&self, topic: &Topic) -> Option<GroupId> {
        topic.group_id(&self.topic_prefix)
    }

    pub fn intended(&self) -> Option<&GroupId> {
        self.intended.as_ref()
    }

    pub fn subscribed(&self) -> Option<&Topic> {
        self.subscribed.as_ref()
    }

    /// 已订阅目标群组的频道
    pub fn is_live(&self) -> bool {
        match (&self.intended, &self.subscribed) {
            (Some(group_id), Some(topic)) => *topic == self.topic_for(group_id),
            _ => false,
        }
    }

    /// 切换目标群组，返回需要执行的退订/订阅
    pub fn switch_to(&mut self, target: Option<GroupId>) -> SwitchPlan {
        let wanted = target.as_ref().map(|id| self.topic_for(id));
        self.intended = target;

        let keep = self.subscribed.is_some() && self.subscribed == wanted;
        let unsubscribe = if keep { None } else { self.subscribed.take() };
        let subscribe = if keep { None } else { wanted };

        SwitchPlan {
            unsubscribe,
            subscribe,
        }
    }

    /// 订阅结果；目标已变化时忽略成功结果
    pub fn on_subscribed(&mut self, topic: &Topic, succeeded: bool) {
        let still_wanted = self
            .intended
            .as_ref()
            .is_some_and(|id| self.topic_for(id) == *topic);
        if succeeded && still_wanted {
            self.subscribed = Some(topic.clone());
        }
    }

    /// 连接中断后网关侧的订阅全部失效
    pub fn on_connection_lost(&mut self) {
        self.subscribed = None;
    }

    /// 需要补订阅的频道（有目标群组但尚未订阅）
    pub fn pending_subscription(&self) -> Option<Topic> {
        match (&self.intended, &self.subscribed) {
            (Some(group_id), None) => Some(self.topic_for(group_id)),
            _ => None,
        }
    }

    /// 登出时需要退订的频道
    pub fn release(&mut self) -> Option<Topic> {
        self.intended = None;
        self.subscribed.take()
    }
}
