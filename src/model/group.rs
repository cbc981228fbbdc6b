use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 群组 ID（后端可能以数字或字符串下发，统一保存为字符串）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for GroupId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 群组审核状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// 待审核：普通成员不可见
    Pending,
    /// 已通过
    Approved,
    /// 已拒绝
    Rejected,
}

/// 群组（社区聊天室）
///
/// 由认证用户创建后处于待审核状态，之后只会被外部管理员通过或拒绝。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    pub created_by: Option<String>,
    pub creator_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub status: GroupStatus,
}

impl Group {
    /// 普通成员是否可见
    pub fn is_visible(&self) -> bool {
        self.status == GroupStatus::Approved
    }
}
