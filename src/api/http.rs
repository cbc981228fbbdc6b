//! 基于 reqwest 的 REST 协作方实现

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use tracing::{debug, warn};

use super::{CreateGroupRequest, HubApi, decode_history};
use crate::config::ApiConfig;
use crate::error::{HubChatError, Result};
use crate::model::{Group, GroupId, Message, OutgoingMessage, SessionIdentity, WireGroup, WireMessage};

#[derive(Serialize)]
struct PostMessageBody<'a> {
    content: &'a str,
    client_msg_id: &'a str,
}

/// HTTP 后端
#[derive(Clone)]
pub struct HttpHubApi {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpHubApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/chat/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// 非 2xx 响应转换为 [`HubChatError::Api`]
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HubChatError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl HubApi for HttpHubApi {
    async fn list_groups(&self) -> Result<Vec<Group>> {
        let url = self.endpoint("groups");
        let response = self.authorize(self.client.get(&url)).send().await?;
        let records: Vec<WireGroup> = Self::check(response).await?.json().await?;

        Ok(records
            .into_iter()
            .filter_map(|record| match record.into_group() {
                Ok(group) => Some(group),
                Err(e) => {
                    warn!(error = %e, "skipping malformed group record");
                    None
                }
            })
            .collect())
    }

    async fn fetch_group_messages(&self, group_id: &GroupId) -> Result<Vec<Message>> {
        let url = self.endpoint(&format!("groups/{}/messages", group_id));
        let response = self.authorize(self.client.get(&url)).send().await?;
        let records: Vec<WireMessage> = Self::check(response).await?.json().await?;
        debug!(group_id = %group_id, count = records.len(), "fetched group history");
        Ok(decode_history(records, group_id))
    }

    async fn post_group_message(&self, draft: &OutgoingMessage) -> Result<Option<Message>> {
        let url = self.endpoint(&format!("groups/{}/messages", draft.group_id));
        let body = PostMessageBody {
            content: &draft.content,
            client_msg_id: &draft.client_msg_id,
        };
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await?;
        let text = Self::check(response).await?.text().await?;
        Ok(stored_record(&text, draft))
    }

    async fn create_group(
        &self,
        request: &CreateGroupRequest,
        _creator: &SessionIdentity,
    ) -> Result<Group> {
        let url = self.endpoint("groups");
        let response = self
            .authorize(self.client.post(&url))
            .json(request)
            .send()
            .await?;
        let text = Self::check(response).await?.text().await?;
        created_group(&text, request)
    }
}

/// 解析持久化响应中的存储记录
///
/// 后端可能只返回确认信息；记录不完整时回退为 `None`，等待回显或下次历史拉取确认。
fn stored_record(body: &str, draft: &OutgoingMessage) -> Option<Message> {
    if body.trim().is_empty() {
        return None;
    }
    let mut wire: WireMessage = serde_json::from_str(body).ok()?;
    wire.id.as_ref()?;
    if wire.client_msg_id.is_none() {
        wire.client_msg_id = Some(draft.client_msg_id.clone());
    }
    match wire.into_message(Some(&draft.group_id)) {
        Ok(message) => Some(message),
        Err(e) => {
            debug!(error = %e, "persistence response carried no usable record");
            None
        }
    }
}

/// 解析建群响应，缺失的名称与审核状态按请求补齐（新群组待审核）
fn created_group(body: &str, request: &CreateGroupRequest) -> Result<Group> {
    let mut wire: WireGroup = if body.trim().is_empty() {
        WireGroup::default()
    } else {
        serde_json::from_str(body)?
    };
    if wire.name.is_none() {
        wire.name = Some(request.name.clone());
    }
    if wire.description.is_none() {
        wire.description = Some(request.description.clone());
    }
    if wire.status.is_none() && wire.is_approved.is_none() {
        wire.status = Some("pending".to_string());
    }
    wire.into_group()
}
