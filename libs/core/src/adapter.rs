use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{RelayError, RelayResult};
use crate::types::{ConnectionStatus, Credentials, Media};

/// Result of a connect/handshake call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectOutcome {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConnectOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            qr_code: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    pub is_ready: bool,
}

/// Message carried by an inbound "message received" webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub from: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<OffsetDateTime>,
}

/// Channel-agnostic projection of a provider webhook.
///
/// Provider vocabularies (connection states, ack names) are kept as strings;
/// the reconciler owns the mapping onto canonical statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    ConnectionUpdate {
        state: String,
    },
    MessageReceived(InboundMessage),
    MessageStatus {
        provider_message_id: String,
        status: String,
    },
    QrCodeUpdated {
        qr_code: String,
    },
    /// The provider echoed a message sent from the connected account. Carries
    /// no state of its own but proves the session is live.
    OutboundEcho {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_message_id: Option<String>,
    },
    Ignored {
        kind: String,
    },
}

impl WebhookEvent {
    pub fn kind(&self) -> &str {
        match self {
            WebhookEvent::ConnectionUpdate { .. } => "connection_update",
            WebhookEvent::MessageReceived(_) => "message_received",
            WebhookEvent::MessageStatus { .. } => "message_status",
            WebhookEvent::QrCodeUpdated { .. } => "qr_code_updated",
            WebhookEvent::OutboundEcho { .. } => "outbound_echo",
            WebhookEvent::Ignored { kind } => kind.as_str(),
        }
    }

    /// Traffic events prove the connection is alive.
    pub fn is_message_activity(&self) -> bool {
        matches!(
            self,
            WebhookEvent::MessageReceived(_)
                | WebhookEvent::MessageStatus { .. }
                | WebhookEvent::OutboundEcho { .. }
        )
    }
}

/// Normalized per-channel behaviour. One implementation per channel kind.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> &str;

    /// Creates the provider-side session when `needs_create` is set (an
    /// "already exists" answer counts as success), then performs the
    /// handshake that yields a fresh QR/pairing artifact. Provider failures are
    /// reported as `ConnectionStatus::Error` with the provider message kept.
    async fn connect(
        &self,
        external_id: &str,
        credentials: Option<&Credentials>,
        needs_create: bool,
    ) -> RelayResult<ConnectOutcome>;

    async fn disconnect(&self, external_id: &str) -> RelayResult<()>;

    async fn send_message(
        &self,
        external_id: &str,
        recipient: &str,
        body: &str,
        media: Option<&Media>,
    ) -> RelayResult<SendReceipt>;

    async fn get_status(&self, external_id: &str) -> RelayResult<StatusReport>;

    fn translate_webhook(&self, raw: &Value) -> RelayResult<WebhookEvent>;
}

/// Bounds an adapter call; an elapsed deadline becomes [`RelayError::Timeout`].
pub async fn with_timeout<T, F>(operation: &'static str, after: Duration, call: F) -> RelayResult<T>
where
    F: Future<Output = RelayResult<T>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout { operation, after }),
    }
}
