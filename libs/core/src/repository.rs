use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::RelayResult;
use crate::types::{
    ConnectionStatus, Group, GroupMember, Instance, Message, MessageStatus, ScheduledAction,
};

/// Persistence of channel instances.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Inserts or replaces the instance. A second instance with the same
    /// `(channel, external_id)` pair is rejected with `Conflict`.
    async fn save_instance(&self, instance: &Instance) -> RelayResult<()>;

    async fn get_instance_by_id(&self, id: &str) -> RelayResult<Option<Instance>>;

    async fn get_instances_by_owner(&self, owner_id: &str) -> RelayResult<Vec<Instance>>;

    async fn get_instance_by_channel_id(
        &self,
        channel: &str,
        external_id: &str,
    ) -> RelayResult<Option<Instance>>;

    /// Returns the updated record, or `None` when the id is unknown.
    async fn update_instance_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        at: OffsetDateTime,
    ) -> RelayResult<Option<Instance>>;

    /// Merges `patch` into the stored metadata map.
    async fn update_instance_metadata(
        &self,
        id: &str,
        patch: BTreeMap<String, Value>,
    ) -> RelayResult<Option<Instance>>;

    async fn delete_instance(&self, id: &str) -> RelayResult<bool>;
}

/// Persistence of sent and received messages.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn log_message(&self, message: &Message) -> RelayResult<()>;

    async fn get_message_by_id(&self, id: &str) -> RelayResult<Option<Message>>;

    async fn get_message_by_provider_id(
        &self,
        instance_id: &str,
        provider_message_id: &str,
    ) -> RelayResult<Option<Message>>;

    /// Stores `status` and stamps the matching `sent_at`/`delivered_at`/`read_at`
    /// when the move is forward (`MessageStatus::can_advance_to`), checked
    /// atomically with the write. A refused move returns the stored record
    /// unchanged.
    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> RelayResult<Option<Message>>;

    async fn update_message_provider_id(
        &self,
        id: &str,
        provider_message_id: &str,
    ) -> RelayResult<()>;

    async fn update_message_error(
        &self,
        id: &str,
        error: &str,
        retry_count: u32,
    ) -> RelayResult<()>;
}

/// Persistence of recipient groups and their members.
#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn create_group(&self, group: &Group) -> RelayResult<()>;

    async fn get_group(&self, id: &str) -> RelayResult<Option<Group>>;

    async fn list_groups(&self, owner_id: &str, instance_id: Option<&str>)
    -> RelayResult<Vec<Group>>;

    /// Adds the member, reactivating an existing row with the same identifier.
    async fn add_group_member(&self, member: &GroupMember) -> RelayResult<GroupMember>;

    async fn remove_group_member(&self, group_id: &str, identifier: &str) -> RelayResult<bool>;

    async fn list_group_members(
        &self,
        group_id: &str,
        active_only: bool,
    ) -> RelayResult<Vec<GroupMember>>;

    /// Replaces the whole member list and stamps `last_sync_at`.
    async fn replace_group_members(
        &self,
        group_id: &str,
        members: &[GroupMember],
        synced_at: OffsetDateTime,
    ) -> RelayResult<()>;
}

/// Persistence of scheduled actions.
#[async_trait]
pub trait ActionRepository: Send + Sync {
    async fn insert_action(&self, action: &ScheduledAction) -> RelayResult<()>;

    async fn get_action(&self, id: &str) -> RelayResult<Option<ScheduledAction>>;

    /// Pending actions with `scheduled_for <= now`, earliest first.
    async fn due_actions(&self, now: OffsetDateTime, limit: usize)
    -> RelayResult<Vec<ScheduledAction>>;

    /// Moves a pending action to processing. Returns `false` if another
    /// worker already claimed it.
    async fn claim_action(&self, id: &str, at: OffsetDateTime) -> RelayResult<bool>;

    /// Settles PROCESSING actions last touched before `stale_before` with
    /// [`ScheduledAction::expire_claim`] and returns them.
    async fn release_stale_actions(
        &self,
        stale_before: OffsetDateTime,
        at: OffsetDateTime,
    ) -> RelayResult<Vec<ScheduledAction>>;

    async fn complete_action(
        &self,
        id: &str,
        result: &Value,
        executed_at: OffsetDateTime,
    ) -> RelayResult<()>;

    /// Returns the action to pending with a later `scheduled_for`.
    async fn reschedule_action(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        next_run: OffsetDateTime,
    ) -> RelayResult<()>;

    async fn fail_action(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        executed_at: OffsetDateTime,
    ) -> RelayResult<()>;
}

/// Everything the dispatch services need from storage.
pub trait Repository: InstanceRepository + MessageRepository + GroupRepository {}

impl<T> Repository for T where T: InstanceRepository + MessageRepository + GroupRepository {}
