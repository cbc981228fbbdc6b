//! 统一错误类型
//!
//! 群聊同步核心对外暴露的所有失败都归入 [`HubChatError`]。

use thiserror::Error;

/// 群聊同步错误类型
#[derive(Debug, Error)]
pub enum HubChatError {
    /// REST 接口返回非 2xx
    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    /// HTTP 传输错误
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 实时通道错误（订阅/退订/发布失败）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 会话未连接
    #[error("Transport session is not connected")]
    NotConnected,

    /// 实时事件或历史记录缺少必填字段
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// 发送内容为空或全为空白
    #[error("Message content is empty")]
    EmptyContent,

    /// 当前没有激活的群组
    #[error("No active group")]
    NoActiveGroup,

    /// 请求参数无效（如群组名称为空）
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 权限不足（如未认证用户创建群组）
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// 事件循环已关闭
    #[error("Hub client is closed")]
    ClientClosed,

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HubChatError {
    /// 是否可由调用方重试（网络与通道类错误）
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HubChatError::Api { .. }
                | HubChatError::Http(_)
                | HubChatError::Transport(_)
                | HubChatError::NotConnected
        )
    }
}

/// 群聊同步结果类型
pub type Result<T> = std::result::Result<T, HubChatError>;
