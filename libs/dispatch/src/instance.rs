use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::{
    AdapterFactory, ConnectOutcome, ConnectionStatus, Credentials, Instance, InstanceRepository,
    RelayError, RelayResult, with_timeout,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{owned_instance, require};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstance {
    pub owner_id: String,
    pub channel: String,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    pub instance_id: String,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Connection lifecycle of tenant instances.
pub struct InstanceService {
    repo: Arc<dyn InstanceRepository>,
    adapters: Arc<AdapterFactory>,
    adapter_timeout: Duration,
}

impl InstanceService {
    pub fn new(
        repo: Arc<dyn InstanceRepository>,
        adapters: Arc<AdapterFactory>,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            adapters,
            adapter_timeout,
        }
    }

    /// Registers the instance and starts the provider handshake.
    ///
    /// The record is persisted before the provider is contacted so a
    /// handshake failure still leaves an ERROR instance the owner can retry.
    pub async fn create_instance(&self, request: CreateInstance) -> RelayResult<InstanceOutcome> {
        require("owner_id", &request.owner_id)?;
        require("channel", &request.channel)?;
        require("external_id", &request.external_id)?;
        if !self.adapters.supports(&request.channel) {
            return Err(RelayError::AdapterNotImplemented(request.channel));
        }
        if let Some(existing) = self
            .repo
            .get_instance_by_channel_id(&request.channel, &request.external_id)
            .await?
        {
            return Err(RelayError::Conflict(format!(
                "instance {}/{} already exists as {}",
                request.channel, request.external_id, existing.id
            )));
        }

        let mut instance = Instance::new(request.owner_id, request.channel, request.external_id);
        instance.address = request.address.filter(|a| !a.trim().is_empty());
        instance.credentials = request.credentials.filter(|c| !c.is_empty());
        self.repo.save_instance(&instance).await?;
        info!(
            owner_id = %instance.owner_id,
            channel = %instance.channel,
            instance_id = %instance.id,
            "instance registered"
        );

        self.connect(&instance, true).await
    }

    /// Requests a fresh handshake for an existing provider session.
    pub async fn reconnect(
        &self,
        owner_id: &str,
        instance_id: &str,
    ) -> RelayResult<InstanceOutcome> {
        let instance = owned_instance(&*self.repo, owner_id, instance_id).await?;
        self.connect(&instance, false).await
    }

    pub async fn disconnect(&self, owner_id: &str, instance_id: &str) -> RelayResult<Instance> {
        let instance = owned_instance(&*self.repo, owner_id, instance_id).await?;
        let adapter = self
            .adapters
            .resolve(&instance.channel, instance.credentials.as_ref())?;
        with_timeout(
            "disconnect",
            self.adapter_timeout,
            adapter.disconnect(&instance.external_id),
        )
        .await?;
        let updated = self
            .persist_status(&instance, ConnectionStatus::Disconnected)
            .await?;
        info!(instance_id = %instance.id, "instance disconnected");
        Ok(updated)
    }

    /// Asks the provider for the live connection state and stores it.
    pub async fn refresh_status(&self, owner_id: &str, instance_id: &str) -> RelayResult<Instance> {
        let instance = owned_instance(&*self.repo, owner_id, instance_id).await?;
        let adapter = self
            .adapters
            .resolve(&instance.channel, instance.credentials.as_ref())?;
        let report = with_timeout(
            "get_status",
            self.adapter_timeout,
            adapter.get_status(&instance.external_id),
        )
        .await?;
        if let Some(qr) = report.qr_code {
            self.patch_metadata(&instance.id, [("qr_code", json!(qr))])
                .await?;
        }
        self.persist_status(&instance, report.status).await
    }

    pub async fn get_instance(&self, owner_id: &str, instance_id: &str) -> RelayResult<Instance> {
        owned_instance(&*self.repo, owner_id, instance_id).await
    }

    pub async fn list_instances(&self, owner_id: &str) -> RelayResult<Vec<Instance>> {
        require("owner_id", owner_id)?;
        self.repo.get_instances_by_owner(owner_id).await
    }

    async fn connect(
        &self,
        instance: &Instance,
        needs_create: bool,
    ) -> RelayResult<InstanceOutcome> {
        let adapter = self
            .adapters
            .resolve(&instance.channel, instance.credentials.as_ref())?;
        let outcome = with_timeout(
            "connect",
            self.adapter_timeout,
            adapter.connect(
                &instance.external_id,
                instance.credentials.as_ref(),
                needs_create,
            ),
        )
        .await
        .unwrap_or_else(|err| ConnectOutcome::error(err.to_string()));

        let mut patch = vec![(
            "last_error",
            outcome.message.clone().map(Value::String).unwrap_or(Value::Null),
        )];
        if let Some(qr) = &outcome.qr_code {
            patch.push(("qr_code", json!(qr)));
        }
        self.patch_metadata(&instance.id, patch).await?;
        self.persist_status(instance, outcome.status).await?;

        if outcome.status == ConnectionStatus::Error {
            warn!(
                instance_id = %instance.id,
                channel = %instance.channel,
                error = outcome.message.as_deref().unwrap_or("unknown"),
                "provider handshake failed"
            );
        } else {
            info!(
                instance_id = %instance.id,
                status = %outcome.status,
                needs_create,
                "provider handshake started"
            );
        }
        Ok(InstanceOutcome {
            instance_id: instance.id.clone(),
            status: outcome.status,
            qr_code: outcome.qr_code,
            message: outcome.message,
        })
    }

    async fn persist_status(
        &self,
        instance: &Instance,
        status: ConnectionStatus,
    ) -> RelayResult<Instance> {
        self.repo
            .update_instance_status(&instance.id, status, OffsetDateTime::now_utc())
            .await?
            .ok_or_else(|| RelayError::not_found("instance", instance.id.clone()))
    }

    async fn patch_metadata<I>(&self, instance_id: &str, entries: I) -> RelayResult<()>
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        let patch: BTreeMap<String, Value> = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        self.repo
            .update_instance_metadata(instance_id, patch)
            .await?;
        Ok(())
    }
}
