use serde::{Deserialize, Serialize};

/// 认证徽章等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationBadge {
    #[default]
    None,
    Verified,
}

/// 会话身份
///
/// 由外部认证模块提供，群聊核心只读不写。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub badge: VerificationBadge,
}

impl SessionIdentity {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        badge: VerificationBadge,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            badge,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.badge == VerificationBadge::Verified
    }
}
