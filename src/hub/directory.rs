//! 群组目录：普通成员只能看到已审核的群组

use crate::api::CreateGroupRequest;
use crate::error::{HubChatError, Result};
use crate::model::{Group, GroupId, SessionIdentity};

#[derive(Debug, Clone, Default)]
pub struct GroupDirectory {
    groups: Vec<Group>,
    loaded: bool,
}

impl GroupDirectory {
    /// 用后端列表替换目录，保留服务端顺序，返回可见群组数
    pub fn replace(&mut self, groups: Vec<Group>) -> usize {
        self.groups = groups.into_iter().filter(Group::is_visible).collect();
        self.loaded = true;
        self.groups.len()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn contains(&self, group_id: &GroupId) -> bool {
        self.groups.iter().any(|g| &g.id == group_id)
    }

    pub fn first(&self) -> Option<&GroupId> {
        self.groups.first().map(|g| &g.id)
    }

    /// 校验建群请求：仅认证用户可建群，名称不能为空
    pub fn prepare_create(
        identity: &SessionIdentity,
        name: &str,
        description: &str,
    ) -> Result<CreateGroupRequest> {
        if !identity.is_verified() {
            return Err(HubChatError::PermissionDenied(
                "only verified members can create groups".to_string(),
            ));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(HubChatError::InvalidInput(
                "group name must not be empty".to_string(),
            ));
        }
        Ok(CreateGroupRequest {
            name: name.to_string(),
            description: description.trim().to_string(),
        })
    }
}
