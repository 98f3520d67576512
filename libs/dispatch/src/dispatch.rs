use std::sync::Arc;
use std::time::Instant;

use relay_bus::{SharedQueue, to_value};
use relay_core::{
    AdapterFactory, Instance, Media, Message, MessageStatus, QueueEvent, RelayError, RelayResult,
    Repository, with_timeout,
};
use relay_telemetry::{
    ADAPTER_LATENCY, MESSAGES_FAILED, MESSAGES_SENT, TelemetryLabels, record_counter,
    record_histogram,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::DispatchConfig;
use crate::{owned_instance_by_channel, require};

/// How accepted sends reach the provider.
#[derive(Clone)]
pub enum SendMode {
    /// The adapter is called on the caller's path; no retry.
    Direct,
    /// The send is enqueued and acknowledged immediately.
    Queued { queue: SharedQueue, topic: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub owner_id: String,
    pub channel: String,
    pub external_id: String,
    pub recipient: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub status: MessageStatus,
}

pub struct DispatchService {
    repo: Arc<dyn Repository>,
    adapters: Arc<AdapterFactory>,
    mode: SendMode,
    config: DispatchConfig,
}

impl DispatchService {
    pub fn new(
        repo: Arc<dyn Repository>,
        adapters: Arc<AdapterFactory>,
        mode: SendMode,
        config: DispatchConfig,
    ) -> Self {
        Self {
            repo,
            adapters,
            mode,
            config,
        }
    }

    pub fn direct(
        repo: Arc<dyn Repository>,
        adapters: Arc<AdapterFactory>,
        config: DispatchConfig,
    ) -> Self {
        Self::new(repo, adapters, SendMode::Direct, config)
    }

    pub fn queued(
        repo: Arc<dyn Repository>,
        adapters: Arc<AdapterFactory>,
        queue: SharedQueue,
        config: DispatchConfig,
    ) -> Self {
        let topic = config.send_topic.clone();
        Self::new(repo, adapters, SendMode::Queued { queue, topic }, config)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.mode, SendMode::Queued { .. })
    }

    pub async fn send(&self, request: SendRequest) -> RelayResult<SendOutcome> {
        require("owner_id", &request.owner_id)?;
        require("channel", &request.channel)?;
        require("external_id", &request.external_id)?;
        let instance = owned_instance_by_channel(
            &*self.repo,
            &request.owner_id,
            &request.channel,
            &request.external_id,
        )
        .await?;
        self.send_via(&instance, &request.recipient, &request.body, request.media)
            .await
    }

    /// Sends through an already resolved and ownership-checked instance.
    pub async fn send_via(
        &self,
        instance: &Instance,
        recipient: &str,
        body: &str,
        media: Option<Media>,
    ) -> RelayResult<SendOutcome> {
        require("recipient", recipient)?;
        if body.trim().is_empty() && media.is_none() {
            return Err(RelayError::validation("body or media is required"));
        }
        match &self.mode {
            SendMode::Direct => self.send_direct(instance, recipient, body, media).await,
            SendMode::Queued { queue, topic } => {
                self.enqueue(queue, topic, instance, recipient, body, media)
                    .await
            }
        }
    }

    async fn send_direct(
        &self,
        instance: &Instance,
        recipient: &str,
        body: &str,
        media: Option<Media>,
    ) -> RelayResult<SendOutcome> {
        let adapter = self
            .adapters
            .resolve(&instance.channel, instance.credentials.as_ref())?;
        let message = Message::outbound(
            instance,
            recipient,
            body,
            media,
            MessageStatus::Pending,
            self.config.max_retries,
        );
        self.repo.log_message(&message).await?;
        let labels = TelemetryLabels::new(&instance.owner_id).channel(&instance.channel);

        let started = Instant::now();
        let sent = with_timeout(
            "send_message",
            self.config.adapter_timeout,
            adapter.send_message(
                &instance.external_id,
                &message.address,
                &message.body,
                message.media.as_ref(),
            ),
        )
        .await;
        record_histogram(
            ADAPTER_LATENCY,
            started.elapsed().as_secs_f64(),
            &labels.clone().with("operation", "send_message"),
        );
        match sent {
            Ok(receipt) => {
                if let Some(provider_id) = &receipt.provider_message_id {
                    self.repo
                        .update_message_provider_id(&message.id, provider_id)
                        .await?;
                }
                self.repo
                    .update_message_status(&message.id, MessageStatus::Sent, receipt.timestamp)
                    .await?;
                record_counter(MESSAGES_SENT, 1, &labels.with("mode", "direct"));
                info!(
                    owner_id = %instance.owner_id,
                    channel = %instance.channel,
                    message_id = %message.id,
                    "message sent"
                );
                Ok(SendOutcome {
                    message_id: message.id,
                    provider_message_id: receipt.provider_message_id,
                    status: MessageStatus::Sent,
                })
            }
            Err(err) => {
                self.repo
                    .update_message_error(&message.id, &err.to_string(), 1)
                    .await?;
                self.repo
                    .update_message_status(
                        &message.id,
                        MessageStatus::Failed,
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                record_counter(
                    MESSAGES_FAILED,
                    1,
                    &labels.with("mode", "direct").with("code", err.code()),
                );
                warn!(
                    owner_id = %instance.owner_id,
                    channel = %instance.channel,
                    message_id = %message.id,
                    error = %err,
                    "direct send failed"
                );
                Err(err)
            }
        }
    }

    async fn enqueue(
        &self,
        queue: &SharedQueue,
        topic: &str,
        instance: &Instance,
        recipient: &str,
        body: &str,
        media: Option<Media>,
    ) -> RelayResult<SendOutcome> {
        if !self.adapters.supports(&instance.channel) {
            return Err(RelayError::AdapterNotImplemented(instance.channel.clone()));
        }
        let message = Message::outbound(
            instance,
            recipient,
            body,
            media,
            MessageStatus::Queued,
            self.config.max_retries,
        );
        self.repo.log_message(&message).await?;

        let event = QueueEvent::for_message(&message, instance);
        let published = match to_value(&event) {
            Ok(payload) => queue.publish(topic, payload, Some(&message.id)).await,
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            let err = RelayError::from(err);
            self.repo
                .update_message_error(&message.id, &err.to_string(), 0)
                .await?;
            self.repo
                .update_message_status(
                    &message.id,
                    MessageStatus::Failed,
                    OffsetDateTime::now_utc(),
                )
                .await?;
            warn!(message_id = %message.id, topic, error = %err, "enqueue failed");
            return Err(err);
        }

        info!(
            owner_id = %instance.owner_id,
            channel = %instance.channel,
            message_id = %message.id,
            topic,
            "message queued"
        );
        Ok(SendOutcome {
            message_id: message.id,
            provider_message_id: None,
            status: MessageStatus::Queued,
        })
    }
}
