use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::{RelayError, RelayResult};
use crate::repository::{ActionRepository, GroupRepository, InstanceRepository, MessageRepository};
use crate::types::{
    ActionStatus, ConnectionStatus, Group, GroupMember, Instance, Message, MessageStatus,
    ScheduledAction,
};

#[derive(Default)]
struct MemoryState {
    instances: HashMap<String, Instance>,
    messages: HashMap<String, Message>,
    groups: HashMap<String, Group>,
    members: HashMap<String, Vec<GroupMember>>,
    actions: HashMap<String, ScheduledAction>,
}

/// Repository kept entirely in process memory.
///
/// Used by tests and by single-node deployments that do not need durability.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    inner: Arc<RwLock<MemoryState>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn messages_for_instance(&self, instance_id: &str) -> Vec<Message> {
        let guard = self.inner.read().await;
        let mut out: Vec<Message> = guard
            .messages
            .values()
            .filter(|m| m.instance_id == instance_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        out
    }
}

#[async_trait]
impl InstanceRepository for InMemoryRepository {
    async fn save_instance(&self, instance: &Instance) -> RelayResult<()> {
        let mut guard = self.inner.write().await;
        let clash = guard.instances.values().any(|existing| {
            existing.id != instance.id
                && existing.channel == instance.channel
                && existing.external_id == instance.external_id
        });
        if clash {
            return Err(RelayError::Conflict(format!(
                "instance {}/{} already exists",
                instance.channel, instance.external_id
            )));
        }
        guard
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance_by_id(&self, id: &str) -> RelayResult<Option<Instance>> {
        Ok(self.inner.read().await.instances.get(id).cloned())
    }

    async fn get_instances_by_owner(&self, owner_id: &str) -> RelayResult<Vec<Instance>> {
        let guard = self.inner.read().await;
        let mut out: Vec<Instance> = guard
            .instances
            .values()
            .filter(|i| i.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        Ok(out)
    }

    async fn get_instance_by_channel_id(
        &self,
        channel: &str,
        external_id: &str,
    ) -> RelayResult<Option<Instance>> {
        let guard = self.inner.read().await;
        Ok(guard
            .instances
            .values()
            .find(|i| i.channel == channel && i.external_id == external_id)
            .cloned())
    }

    async fn update_instance_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        at: OffsetDateTime,
    ) -> RelayResult<Option<Instance>> {
        let mut guard = self.inner.write().await;
        Ok(guard.instances.get_mut(id).map(|instance| {
            instance.apply_status(status, at);
            instance.clone()
        }))
    }

    async fn update_instance_metadata(
        &self,
        id: &str,
        patch: BTreeMap<String, Value>,
    ) -> RelayResult<Option<Instance>> {
        let mut guard = self.inner.write().await;
        Ok(guard.instances.get_mut(id).map(|instance| {
            instance.metadata.extend(patch);
            instance.updated_at = OffsetDateTime::now_utc();
            instance.clone()
        }))
    }

    async fn delete_instance(&self, id: &str) -> RelayResult<bool> {
        Ok(self.inner.write().await.instances.remove(id).is_some())
    }
}

#[async_trait]
impl MessageRepository for InMemoryRepository {
    async fn log_message(&self, message: &Message) -> RelayResult<()> {
        self.inner
            .write()
            .await
            .messages
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_message_by_id(&self, id: &str) -> RelayResult<Option<Message>> {
        Ok(self.inner.read().await.messages.get(id).cloned())
    }

    async fn get_message_by_provider_id(
        &self,
        instance_id: &str,
        provider_message_id: &str,
    ) -> RelayResult<Option<Message>> {
        let guard = self.inner.read().await;
        Ok(guard
            .messages
            .values()
            .find(|m| {
                m.instance_id == instance_id
                    && m.provider_message_id.as_deref() == Some(provider_message_id)
            })
            .cloned())
    }

    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> RelayResult<Option<Message>> {
        let mut guard = self.inner.write().await;
        Ok(guard.messages.get_mut(id).map(|message| {
            message.advance_status(status, at);
            message.clone()
        }))
    }

    async fn update_message_provider_id(
        &self,
        id: &str,
        provider_message_id: &str,
    ) -> RelayResult<()> {
        let mut guard = self.inner.write().await;
        let message = guard
            .messages
            .get_mut(id)
            .ok_or_else(|| RelayError::not_found("message", id))?;
        message.provider_message_id = Some(provider_message_id.to_string());
        message.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn update_message_error(
        &self,
        id: &str,
        error: &str,
        retry_count: u32,
    ) -> RelayResult<()> {
        let mut guard = self.inner.write().await;
        let message = guard
            .messages
            .get_mut(id)
            .ok_or_else(|| RelayError::not_found("message", id))?;
        message.error = Some(error.to_string());
        message.retry_count = retry_count;
        message.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }
}

#[async_trait]
impl GroupRepository for InMemoryRepository {
    async fn create_group(&self, group: &Group) -> RelayResult<()> {
        let mut guard = self.inner.write().await;
        if guard.groups.contains_key(&group.id) {
            return Err(RelayError::Conflict(format!(
                "group {} already exists",
                group.id
            )));
        }
        guard.groups.insert(group.id.clone(), group.clone());
        guard.members.entry(group.id.clone()).or_default();
        Ok(())
    }

    async fn get_group(&self, id: &str) -> RelayResult<Option<Group>> {
        Ok(self.inner.read().await.groups.get(id).cloned())
    }

    async fn list_groups(
        &self,
        owner_id: &str,
        instance_id: Option<&str>,
    ) -> RelayResult<Vec<Group>> {
        let guard = self.inner.read().await;
        let mut out: Vec<Group> = guard
            .groups
            .values()
            .filter(|g| g.owner_id == owner_id)
            .filter(|g| instance_id.is_none_or(|wanted| g.instance_id == wanted))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn add_group_member(&self, member: &GroupMember) -> RelayResult<GroupMember> {
        let mut guard = self.inner.write().await;
        if !guard.groups.contains_key(&member.group_id) {
            return Err(RelayError::not_found("group", &member.group_id));
        }
        let members = guard.members.entry(member.group_id.clone()).or_default();
        if let Some(existing) = members
            .iter_mut()
            .find(|m| m.identifier == member.identifier)
        {
            existing.active = true;
            existing.identifier_kind = member.identifier_kind;
            if member.display_name.is_some() {
                existing.display_name = member.display_name.clone();
            }
            return Ok(existing.clone());
        }
        members.push(member.clone());
        Ok(member.clone())
    }

    async fn remove_group_member(&self, group_id: &str, identifier: &str) -> RelayResult<bool> {
        let mut guard = self.inner.write().await;
        let Some(members) = guard.members.get_mut(group_id) else {
            return Ok(false);
        };
        let before = members.len();
        members.retain(|m| m.identifier != identifier);
        Ok(members.len() != before)
    }

    async fn list_group_members(
        &self,
        group_id: &str,
        active_only: bool,
    ) -> RelayResult<Vec<GroupMember>> {
        let guard = self.inner.read().await;
        Ok(guard
            .members
            .get(group_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| !active_only || m.active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn replace_group_members(
        &self,
        group_id: &str,
        members: &[GroupMember],
        synced_at: OffsetDateTime,
    ) -> RelayResult<()> {
        let mut guard = self.inner.write().await;
        let group = guard
            .groups
            .get_mut(group_id)
            .ok_or_else(|| RelayError::not_found("group", group_id))?;
        group.last_sync_at = Some(synced_at);
        group.updated_at = synced_at;
        guard
            .members
            .insert(group_id.to_string(), members.to_vec());
        Ok(())
    }
}

#[async_trait]
impl ActionRepository for InMemoryRepository {
    async fn insert_action(&self, action: &ScheduledAction) -> RelayResult<()> {
        self.inner
            .write()
            .await
            .actions
            .insert(action.id.clone(), action.clone());
        Ok(())
    }

    async fn get_action(&self, id: &str) -> RelayResult<Option<ScheduledAction>> {
        Ok(self.inner.read().await.actions.get(id).cloned())
    }

    async fn due_actions(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> RelayResult<Vec<ScheduledAction>> {
        let guard = self.inner.read().await;
        let mut due: Vec<ScheduledAction> = guard
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Pending && a.scheduled_for <= now)
            .cloned()
            .collect();
        due.sort_by_key(|a| a.scheduled_for);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_action(&self, id: &str, at: OffsetDateTime) -> RelayResult<bool> {
        let mut guard = self.inner.write().await;
        match guard.actions.get_mut(id) {
            Some(action) if action.status == ActionStatus::Pending => {
                action.status = ActionStatus::Processing;
                action.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_stale_actions(
        &self,
        stale_before: OffsetDateTime,
        at: OffsetDateTime,
    ) -> RelayResult<Vec<ScheduledAction>> {
        let mut guard = self.inner.write().await;
        let mut released: Vec<ScheduledAction> = guard
            .actions
            .values_mut()
            .filter(|a| a.status == ActionStatus::Processing && a.updated_at < stale_before)
            .map(|action| {
                action.expire_claim(at);
                action.clone()
            })
            .collect();
        released.sort_by_key(|a| a.created_at);
        Ok(released)
    }

    async fn complete_action(
        &self,
        id: &str,
        result: &Value,
        executed_at: OffsetDateTime,
    ) -> RelayResult<()> {
        let mut guard = self.inner.write().await;
        let action = guard
            .actions
            .get_mut(id)
            .ok_or_else(|| RelayError::not_found("action", id))?;
        action.status = ActionStatus::Completed;
        action.result = Some(result.clone());
        action.executed_at = Some(executed_at);
        action.updated_at = executed_at;
        Ok(())
    }

    async fn reschedule_action(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        next_run: OffsetDateTime,
    ) -> RelayResult<()> {
        let mut guard = self.inner.write().await;
        let action = guard
            .actions
            .get_mut(id)
            .ok_or_else(|| RelayError::not_found("action", id))?;
        action.status = ActionStatus::Pending;
        action.attempts = attempts;
        action.last_error = Some(error.to_string());
        action.scheduled_for = next_run;
        action.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn fail_action(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        executed_at: OffsetDateTime,
    ) -> RelayResult<()> {
        let mut guard = self.inner.write().await;
        let action = guard
            .actions
            .get_mut(id)
            .ok_or_else(|| RelayError::not_found("action", id))?;
        action.status = ActionStatus::Failed;
        action.attempts = attempts;
        action.last_error = Some(error.to_string());
        action.executed_at = Some(executed_at);
        action.updated_at = executed_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupKind, IdentifierKind, new_id};
    use serde_json::json;
    use time::Duration;

    fn action(at: OffsetDateTime) -> ScheduledAction {
        ScheduledAction {
            id: new_id(),
            owner_id: "owner-1".into(),
            action_type: "api_call".into(),
            payload: json!({}),
            scheduled_for: at,
            status: ActionStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            result: None,
            executed_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn channel_external_pair_is_unique() {
        let repo = InMemoryRepository::new();
        let first = Instance::new("owner-1", "whatsapp", "store-1");
        repo.save_instance(&first).await.unwrap();
        // re-saving the same record is an update
        repo.save_instance(&first).await.unwrap();

        let dup = Instance::new("owner-2", "whatsapp", "store-1");
        let err = repo.save_instance(&dup).await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));

        let other_channel = Instance::new("owner-2", "telegram", "store-1");
        repo.save_instance(&other_channel).await.unwrap();
    }

    #[tokio::test]
    async fn due_actions_are_ordered_and_claimed_once() {
        let repo = InMemoryRepository::new();
        let now = OffsetDateTime::now_utc();
        let late = action(now - Duration::minutes(1));
        let early = action(now - Duration::minutes(5));
        let future = action(now + Duration::minutes(5));
        for a in [&late, &early, &future] {
            repo.insert_action(a).await.unwrap();
        }

        let due = repo.due_actions(now, 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec![early.id.clone(), late.id.clone()]);

        assert!(repo.claim_action(&early.id, now).await.unwrap());
        assert!(!repo.claim_action(&early.id, now).await.unwrap());
        assert_eq!(repo.due_actions(now, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_claims_are_released_then_failed() {
        let repo = InMemoryRepository::new();
        let now = OffsetDateTime::now_utc();
        let mut stuck = action(now - Duration::hours(1));
        stuck.max_attempts = 2;
        repo.insert_action(&stuck).await.unwrap();
        let fresh = action(now - Duration::hours(1));
        repo.insert_action(&fresh).await.unwrap();
        repo.claim_action(&stuck.id, now - Duration::minutes(30))
            .await
            .unwrap();
        repo.claim_action(&fresh.id, now).await.unwrap();

        let stale_before = now - Duration::minutes(5);
        let released = repo.release_stale_actions(stale_before, now).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, stuck.id);
        assert_eq!(released[0].status, ActionStatus::Pending);
        assert_eq!(released[0].attempts, 1);
        assert_eq!(repo.due_actions(now, 10).await.unwrap().len(), 1);

        repo.claim_action(&stuck.id, now - Duration::minutes(30))
            .await
            .unwrap();
        let released = repo.release_stale_actions(stale_before, now).await.unwrap();
        assert_eq!(released[0].status, ActionStatus::Failed);
        assert_eq!(released[0].attempts, 2);
        let fresh = repo.get_action(&fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, ActionStatus::Processing);
    }

    #[tokio::test]
    async fn re_adding_a_member_reactivates_it() {
        let repo = InMemoryRepository::new();
        let now = OffsetDateTime::now_utc();
        let group = Group {
            id: new_id(),
            owner_id: "owner-1".into(),
            instance_id: "inst-1".into(),
            name: "vip".into(),
            kind: GroupKind::Custom,
            external_group_id: None,
            is_synced: false,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        };
        repo.create_group(&group).await.unwrap();
        let mut member = GroupMember {
            id: new_id(),
            group_id: group.id.clone(),
            identifier: "5551234".into(),
            identifier_kind: IdentifierKind::Phone,
            display_name: None,
            active: false,
        };
        repo.add_group_member(&member).await.unwrap();
        assert!(
            repo.list_group_members(&group.id, true)
                .await
                .unwrap()
                .is_empty()
        );

        member.id = new_id();
        member.active = true;
        let stored = repo.add_group_member(&member).await.unwrap();
        assert!(stored.active);
        assert_eq!(repo.list_group_members(&group.id, false).await.unwrap().len(), 1);
    }
}
