//! Message dispatch for the relay runtime.
//!
//! [`DispatchService`] sends either directly through a channel adapter or by
//! enqueueing onto a [`relay_bus::DurableQueue`] that a [`SendConsumer`]
//! drains with bounded retries. [`WebhookReconciler`] folds provider webhooks
//! back into stored state, [`InstanceService`] manages connections and
//! [`GroupService`] fans a message out to group members.

use relay_core::{Instance, InstanceRepository, RelayError, RelayResult};

mod config;
mod consumer;
mod dispatch;
mod group;
mod instance;
mod webhook;

pub use config::DispatchConfig;
pub use consumer::{ProcessOutcome, SendConsumer};
pub use dispatch::{DispatchService, SendMode, SendOutcome, SendRequest};
pub use group::{
    CreateGroup, GroupSendReport, GroupService, MemberError, NewMember, SendResult, SendTarget,
};
pub use instance::{CreateInstance, InstanceOutcome, InstanceService};
pub use webhook::{Reconciled, WebhookReconciler};

/// Loads an instance by `(channel, external_id)` and checks it belongs to `owner_id`.
pub(crate) async fn owned_instance_by_channel<R: InstanceRepository + ?Sized>(
    repo: &R,
    owner_id: &str,
    channel: &str,
    external_id: &str,
) -> RelayResult<Instance> {
    let instance = repo
        .get_instance_by_channel_id(channel, external_id)
        .await?
        .ok_or_else(|| RelayError::not_found("instance", format!("{channel}/{external_id}")))?;
    ensure_owner(instance, owner_id)
}

pub(crate) async fn owned_instance<R: InstanceRepository + ?Sized>(
    repo: &R,
    owner_id: &str,
    instance_id: &str,
) -> RelayResult<Instance> {
    let instance = repo
        .get_instance_by_id(instance_id)
        .await?
        .ok_or_else(|| RelayError::not_found("instance", instance_id))?;
    ensure_owner(instance, owner_id)
}

fn ensure_owner(instance: Instance, owner_id: &str) -> RelayResult<Instance> {
    if instance.is_owned_by(owner_id) {
        Ok(instance)
    } else {
        Err(RelayError::forbidden("instance", instance.id))
    }
}

pub(crate) fn require(field: &str, value: &str) -> RelayResult<()> {
    if value.trim().is_empty() {
        return Err(RelayError::validation(format!("{field} is required")));
    }
    Ok(())
}
