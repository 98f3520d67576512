use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::RelayError;

/// Generates a fresh record identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Canonical connection state of an [`Instance`].
///
/// ```
/// use relay_core::ConnectionStatus;
///
/// assert_eq!(ConnectionStatus::from_provider_state("open"), Some(ConnectionStatus::Connected));
/// assert_eq!(ConnectionStatus::from_provider_state("pairing"), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Connecting,
    Error,
    Pending,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Error => "ERROR",
            ConnectionStatus::Pending => "PENDING",
        }
    }

    /// Maps the provider connection vocabulary onto the canonical enum.
    /// Unrecognized states yield `None` and must not change stored state.
    pub fn from_provider_state(state: &str) -> Option<Self> {
        match state.trim().to_ascii_lowercase().as_str() {
            "open" | "connected" => Some(ConnectionStatus::Connected),
            "close" | "closed" | "disconnected" => Some(ConnectionStatus::Disconnected),
            "connecting" => Some(ConnectionStatus::Connecting),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTED" => Ok(ConnectionStatus::Connected),
            "DISCONNECTED" => Ok(ConnectionStatus::Disconnected),
            "CONNECTING" => Ok(ConnectionStatus::Connecting),
            "ERROR" => Ok(ConnectionStatus::Error),
            "PENDING" => Ok(ConnectionStatus::Pending),
            other => Err(RelayError::validation(format!(
                "unknown connection status: {other}"
            ))),
        }
    }
}

/// Delivery state of a [`Message`].
///
/// Transitions only move forward:
/// `PENDING/QUEUED < PROCESSING < SENT < DELIVERED < READ`, with `FAILED`
/// terminal unless a provider acknowledgement later proves delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Queued,
    Processing,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Processing => "PROCESSING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending | MessageStatus::Queued => 0,
            MessageStatus::Processing => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
            MessageStatus::Failed => 5,
        }
    }

    /// The provider accepted the message; nothing left to send.
    pub fn is_sent(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
        )
    }

    /// No further send attempt may be made for a message in this state.
    pub fn is_final(&self) -> bool {
        self.is_sent() || *self == MessageStatus::Failed
    }

    /// Whether moving from `self` to `next` respects the monotonic order.
    ///
    /// ```
    /// use relay_core::MessageStatus::*;
    ///
    /// assert!(Queued.can_advance_to(Processing));
    /// assert!(Sent.can_advance_to(Read));
    /// assert!(!Read.can_advance_to(Delivered));
    /// assert!(!Sent.can_advance_to(Failed));
    /// assert!(Failed.can_advance_to(Delivered));
    /// ```
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        if *self == next {
            return false;
        }
        match (self, next) {
            (MessageStatus::Failed, MessageStatus::Delivered | MessageStatus::Read) => true,
            (MessageStatus::Failed, _) => false,
            (current, MessageStatus::Failed) => !current.is_sent(),
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Maps a provider acknowledgement vocabulary onto message states.
    pub fn from_provider_ack(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "sent" | "server_ack" => Some(MessageStatus::Sent),
            "delivered" | "delivery_ack" => Some(MessageStatus::Delivered),
            "read" | "played" => Some(MessageStatus::Read),
            "failed" | "error" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MessageStatus::Pending),
            "QUEUED" => Ok(MessageStatus::Queued),
            "PROCESSING" => Ok(MessageStatus::Processing),
            "SENT" => Ok(MessageStatus::Sent),
            "DELIVERED" => Ok(MessageStatus::Delivered),
            "READ" => Ok(MessageStatus::Read),
            "FAILED" => Ok(MessageStatus::Failed),
            other => Err(RelayError::validation(format!(
                "unknown message status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

impl FromStr for Direction {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Direction::Sent),
            "received" => Ok(Direction::Received),
            other => Err(RelayError::validation(format!("unknown direction: {other}"))),
        }
    }
}

/// Lifecycle of a [`ScheduledAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "PENDING",
            ActionStatus::Processing => "PROCESSING",
            ActionStatus::Completed => "COMPLETED",
            ActionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ActionStatus::Pending),
            "PROCESSING" => Ok(ActionStatus::Processing),
            "COMPLETED" => Ok(ActionStatus::Completed),
            "FAILED" => Ok(ActionStatus::Failed),
            other => Err(RelayError::validation(format!(
                "unknown action status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Custom,
    Synced,
}

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Custom => "custom",
            GroupKind::Synced => "synced",
        }
    }
}

impl FromStr for GroupKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "custom" => Ok(GroupKind::Custom),
            "synced" => Ok(GroupKind::Synced),
            other => Err(RelayError::validation(format!("unknown group kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Phone,
    Username,
    Email,
    ChatId,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Phone => "phone",
            IdentifierKind::Username => "username",
            IdentifierKind::Email => "email",
            IdentifierKind::ChatId => "chat_id",
        }
    }
}

impl FromStr for IdentifierKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phone" => Ok(IdentifierKind::Phone),
            "username" => Ok(IdentifierKind::Username),
            "email" => Ok(IdentifierKind::Email),
            "chat_id" => Ok(IdentifierKind::ChatId),
            other => Err(RelayError::validation(format!(
                "unknown identifier kind: {other}"
            ))),
        }
    }
}

/// Per-tenant provider credentials. Channel specific keys go into `extra`.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.api_base.is_none() && self.api_key.is_none() && self.extra.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Media attached to a message; the relay only carries the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// One tenant's connection to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub owner_id: String,
    pub channel: String,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_connected_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_disconnected_at: Option<OffsetDateTime>,
}

impl Instance {
    pub fn new(
        owner_id: impl Into<String>,
        channel: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: new_id(),
            owner_id: owner_id.into(),
            channel: channel.into(),
            external_id: external_id.into(),
            address: None,
            status: ConnectionStatus::Pending,
            credentials: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            last_connected_at: None,
            last_disconnected_at: None,
        }
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    /// Applies a status change in place, stamping the connect/disconnect times.
    pub fn apply_status(&mut self, status: ConnectionStatus, at: OffsetDateTime) {
        if self.status != status {
            match status {
                ConnectionStatus::Connected => self.last_connected_at = Some(at),
                ConnectionStatus::Disconnected => self.last_disconnected_at = Some(at),
                _ => {}
            }
        }
        self.status = status;
        self.updated_at = at;
    }
}

/// One outbound or inbound unit of communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub owner_id: String,
    pub instance_id: String,
    pub channel: String,
    /// Recipient for sent messages, sender for received ones.
    pub address: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
    pub direction: Direction,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
}

impl Message {
    pub fn outbound(
        instance: &Instance,
        recipient: impl Into<String>,
        body: impl Into<String>,
        media: Option<Media>,
        status: MessageStatus,
        max_retries: u32,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: new_id(),
            owner_id: instance.owner_id.clone(),
            instance_id: instance.id.clone(),
            channel: instance.channel.clone(),
            address: recipient.into(),
            body: body.into(),
            media,
            direction: Direction::Sent,
            status,
            provider_message_id: None,
            retry_count: 0,
            max_retries,
            error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
        }
    }

    pub fn inbound(
        instance: &Instance,
        sender: impl Into<String>,
        body: impl Into<String>,
        media: Option<Media>,
        provider_message_id: Option<String>,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: new_id(),
            owner_id: instance.owner_id.clone(),
            instance_id: instance.id.clone(),
            channel: instance.channel.clone(),
            address: sender.into(),
            body: body.into(),
            media,
            direction: Direction::Received,
            status: MessageStatus::Delivered,
            provider_message_id,
            retry_count: 0,
            max_retries: 0,
            error: None,
            created_at: received_at,
            updated_at: received_at,
            sent_at: None,
            delivered_at: Some(received_at),
            read_at: None,
        }
    }

    /// Moves to `status` when the transition is forward, stamping the
    /// matching timestamp. Returns `false` and leaves the record untouched
    /// otherwise.
    pub fn advance_status(&mut self, status: MessageStatus, at: OffsetDateTime) -> bool {
        if !self.status.can_advance_to(status) {
            return false;
        }
        match status {
            MessageStatus::Sent => self.sent_at = Some(at),
            MessageStatus::Delivered => self.delivered_at = Some(at),
            MessageStatus::Read => self.read_at = Some(at),
            _ => {}
        }
        self.status = status;
        self.updated_at = at;
        true
    }
}

/// Addressable collection of recipients scoped to one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub owner_id: String,
    pub instance_id: String,
    pub name: String,
    pub kind: GroupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_group_id: Option<String>,
    pub is_synced: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_sync_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: String,
    pub group_id: String,
    pub identifier: String,
    pub identifier_kind: IdentifierKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub active: bool,
}

/// Generic deferred unit of work polled by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: String,
    pub owner_id: String,
    pub action_type: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    pub status: ActionStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub executed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ScheduledAction {
    /// Settles a claim that outlived its lease. The lost run counts as an
    /// attempt: the action is due again at `at`, or FAILED once out of attempts.
    pub fn expire_claim(&mut self, at: OffsetDateTime) {
        self.attempts += 1;
        self.last_error = Some("processing lease expired".to_string());
        self.updated_at = at;
        if self.attempts >= self.max_attempts {
            self.status = ActionStatus::Failed;
            self.executed_at = Some(at);
        } else {
            self.status = ActionStatus::Pending;
            self.scheduled_for = at;
        }
    }
}

/// Serialized projection of a send request carried across the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub message_id: String,
    pub owner_id: String,
    pub channel: String,
    pub instance_id: String,
    pub instance_external_id: String,
    pub recipient: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueueEvent {
    pub fn for_message(message: &Message, instance: &Instance) -> Self {
        Self {
            message_id: message.id.clone(),
            owner_id: message.owner_id.clone(),
            channel: instance.channel.clone(),
            instance_id: instance.id.clone(),
            instance_external_id: instance.external_id.clone(),
            recipient: message.address.clone(),
            body: message.body.clone(),
            media: message.media.clone(),
            credentials: instance.credentials.clone(),
            retry_count: message.retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_roundtrip_through_from_str() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Queued,
            MessageStatus::Processing,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("BOUNCED".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn queued_and_pending_share_a_rank() {
        assert!(!MessageStatus::Pending.can_advance_to(MessageStatus::Queued));
        assert!(MessageStatus::Pending.can_advance_to(MessageStatus::Sent));
        assert!(MessageStatus::Processing.can_advance_to(MessageStatus::Failed));
        assert!(!MessageStatus::Failed.can_advance_to(MessageStatus::Sent));
    }

    #[test]
    fn instance_status_stamps_transition_times() {
        let mut instance = Instance::new("owner-1", "whatsapp", "store-1");
        let at = OffsetDateTime::now_utc();
        instance.apply_status(ConnectionStatus::Connected, at);
        assert_eq!(instance.last_connected_at, Some(at));
        instance.apply_status(ConnectionStatus::Disconnected, at);
        assert_eq!(instance.last_disconnected_at, Some(at));
    }

    #[test]
    fn credentials_debug_redacts_key() {
        let creds = Credentials {
            api_base: Some("https://chat.example".into()),
            api_key: Some("secret-key".into()),
            extra: BTreeMap::new(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn queue_event_snapshots_instance_credentials() {
        let mut instance = Instance::new("owner-1", "whatsapp", "store-1");
        instance.credentials = Some(Credentials {
            api_key: Some("k".into()),
            ..Credentials::default()
        });
        let message = Message::outbound(
            &instance,
            "5551234",
            "hi",
            None,
            MessageStatus::Queued,
            3,
        );
        let event = QueueEvent::for_message(&message, &instance);
        assert_eq!(event.instance_external_id, "store-1");
        assert_eq!(event.credentials, instance.credentials);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["retry_count"], 0);
    }
}
