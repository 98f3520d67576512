use std::collections::HashSet;
use std::sync::Arc;

use relay_core::{
    Group, GroupKind, GroupMember, IdentifierKind, Media, RelayError, RelayResult, Repository,
    new_id,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::dispatch::{DispatchService, SendOutcome, SendRequest};
use crate::{owned_instance, owned_instance_by_channel, require};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroup {
    pub owner_id: String,
    pub instance_id: String,
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: GroupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_group_id: Option<String>,
}

fn default_kind() -> GroupKind {
    GroupKind::Custom
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMember {
    pub identifier: String,
    #[serde(default = "default_identifier_kind")]
    pub identifier_kind: IdentifierKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

fn default_identifier_kind() -> IdentifierKind {
    IdentifierKind::Phone
}

impl NewMember {
    pub fn phone(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            identifier_kind: IdentifierKind::Phone,
            display_name: None,
        }
    }

    fn into_member(self, group_id: &str) -> GroupMember {
        GroupMember {
            id: new_id(),
            group_id: group_id.to_string(),
            identifier: self.identifier.trim().to_string(),
            identifier_kind: self.identifier_kind,
            display_name: self.display_name,
            active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberError {
    pub identifier: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSendReport {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub errors: Vec<MemberError>,
}

/// Result of a send addressed to either one recipient or a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SendResult {
    Individual(SendOutcome),
    Group(GroupSendReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    Address(String),
    Group(String),
}

/// Groups of recipients bound to one instance, and fan-out to their members.
///
/// Synced groups mirror a provider-side group. Their membership only changes
/// through [`GroupService::sync_group_members`].
pub struct GroupService {
    repo: Arc<dyn Repository>,
    dispatch: Arc<DispatchService>,
}

impl GroupService {
    pub fn new(repo: Arc<dyn Repository>, dispatch: Arc<DispatchService>) -> Self {
        Self { repo, dispatch }
    }

    pub async fn create_group(&self, request: CreateGroup) -> RelayResult<Group> {
        require("name", &request.name)?;
        let instance = owned_instance(&*self.repo, &request.owner_id, &request.instance_id).await?;
        let external_group_id = request
            .external_group_id
            .filter(|id| !id.trim().is_empty());
        if request.kind == GroupKind::Synced && external_group_id.is_none() {
            return Err(RelayError::validation(
                "synced groups require external_group_id",
            ));
        }

        let now = OffsetDateTime::now_utc();
        let group = Group {
            id: new_id(),
            owner_id: instance.owner_id,
            instance_id: instance.id,
            name: request.name.trim().to_string(),
            kind: request.kind,
            external_group_id,
            is_synced: request.kind == GroupKind::Synced,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.create_group(&group).await?;
        info!(group_id = %group.id, kind = group.kind.as_str(), "group created");
        Ok(group)
    }

    /// Loads a group, rejecting callers that do not own it.
    pub async fn get_group(&self, owner_id: &str, group_id: &str) -> RelayResult<Group> {
        let group = self
            .repo
            .get_group(group_id)
            .await?
            .ok_or_else(|| RelayError::not_found("group", group_id))?;
        if group.owner_id != owner_id {
            return Err(RelayError::forbidden("group", group.id));
        }
        Ok(group)
    }

    pub async fn list_groups(
        &self,
        owner_id: &str,
        instance_id: Option<&str>,
    ) -> RelayResult<Vec<Group>> {
        require("owner_id", owner_id)?;
        self.repo.list_groups(owner_id, instance_id).await
    }

    pub async fn add_member(
        &self,
        owner_id: &str,
        group_id: &str,
        member: NewMember,
    ) -> RelayResult<GroupMember> {
        require("identifier", &member.identifier)?;
        let group = self.writable_group(owner_id, group_id).await?;
        self.repo
            .add_group_member(&member.into_member(&group.id))
            .await
    }

    pub async fn remove_member(
        &self,
        owner_id: &str,
        group_id: &str,
        identifier: &str,
    ) -> RelayResult<bool> {
        let group = self.writable_group(owner_id, group_id).await?;
        self.repo.remove_group_member(&group.id, identifier).await
    }

    /// Active members only.
    pub async fn list_members(
        &self,
        owner_id: &str,
        group_id: &str,
    ) -> RelayResult<Vec<GroupMember>> {
        let group = self.get_group(owner_id, group_id).await?;
        self.repo.list_group_members(&group.id, true).await
    }

    /// Replaces a synced group's membership with the provider's current list.
    pub async fn sync_group_members(
        &self,
        owner_id: &str,
        group_id: &str,
        members: Vec<NewMember>,
    ) -> RelayResult<Vec<GroupMember>> {
        let group = self.get_group(owner_id, group_id).await?;
        if !group.is_synced {
            return Err(RelayError::validation(format!(
                "group {} is not synced from the provider",
                group.id
            )));
        }
        let mut seen = HashSet::new();
        let members: Vec<GroupMember> = members
            .into_iter()
            .filter(|m| !m.identifier.trim().is_empty())
            .map(|m| m.into_member(&group.id))
            .filter(|m| seen.insert(m.identifier.clone()))
            .collect();
        self.repo
            .replace_group_members(&group.id, &members, OffsetDateTime::now_utc())
            .await?;
        info!(group_id = %group.id, members = members.len(), "group members synced");
        Ok(members)
    }

    /// Sends `body` to every active member. A failing member is recorded in
    /// the report and never stops the remaining sends.
    pub async fn send_to_group(
        &self,
        group_id: &str,
        owner_id: &str,
        body: &str,
        media: Option<Media>,
    ) -> RelayResult<GroupSendReport> {
        if body.trim().is_empty() && media.is_none() {
            return Err(RelayError::validation("body or media is required"));
        }
        let group = self.get_group(owner_id, group_id).await?;
        let instance = owned_instance(&*self.repo, owner_id, &group.instance_id).await?;
        let members = self.repo.list_group_members(&group.id, true).await?;

        let mut report = GroupSendReport {
            total: members.len(),
            ..GroupSendReport::default()
        };
        for member in members {
            match self
                .dispatch
                .send_via(&instance, &member.identifier, body, media.clone())
                .await
            {
                Ok(_) => report.sent += 1,
                Err(err) => {
                    warn!(
                        group_id = %group.id,
                        identifier = %member.identifier,
                        error = %err,
                        "group member send failed"
                    );
                    report.failed += 1;
                    report.errors.push(MemberError {
                        identifier: member.identifier,
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            group_id = %group.id,
            total = report.total,
            sent = report.sent,
            failed = report.failed,
            "group fan-out finished"
        );
        Ok(report)
    }

    /// Single entry point for sends addressed either to a recipient or to a
    /// group bound to the same instance.
    pub async fn send_targeted(
        &self,
        owner_id: &str,
        channel: &str,
        external_id: &str,
        target: SendTarget,
        body: &str,
        media: Option<Media>,
    ) -> RelayResult<SendResult> {
        match target {
            SendTarget::Address(recipient) => self
                .dispatch
                .send(SendRequest {
                    owner_id: owner_id.to_string(),
                    channel: channel.to_string(),
                    external_id: external_id.to_string(),
                    recipient,
                    body: body.to_string(),
                    media,
                })
                .await
                .map(SendResult::Individual),
            SendTarget::Group(group_id) => {
                let instance =
                    owned_instance_by_channel(&*self.repo, owner_id, channel, external_id).await?;
                let group = self.get_group(owner_id, &group_id).await?;
                if group.instance_id != instance.id {
                    return Err(RelayError::validation(format!(
                        "group {} is not bound to instance {channel}/{external_id}",
                        group.id
                    )));
                }
                self.send_to_group(&group.id, owner_id, body, media)
                    .await
                    .map(SendResult::Group)
            }
        }
    }

    async fn writable_group(&self, owner_id: &str, group_id: &str) -> RelayResult<Group> {
        let group = self.get_group(owner_id, group_id).await?;
        if group.is_synced {
            return Err(RelayError::ReadOnlyGroup(group.id));
        }
        Ok(group)
    }
}
