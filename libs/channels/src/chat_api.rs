use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{
    AdapterFactory, ChannelAdapter, ConnectOutcome, ConnectionStatus, Credentials, InboundMessage,
    Media, RelayError, RelayResult, SendReceipt, StatusReport, WebhookEvent,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const CHANNEL: &str = "whatsapp";

const API_BASE_ENV: &str = "CHAT_API_BASE";
const API_KEY_ENV: &str = "CHAT_API_KEY";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MOCK_SCHEME: &str = "mock://";
const JID_SUFFIXES: [&str; 3] = ["@s.whatsapp.net", "@c.us", "@g.us"];

/// Process-wide connection settings used when an instance carries no
/// credentials of its own.
#[derive(Debug, Clone)]
pub struct ChatApiDefaults {
    pub api_base: String,
    pub api_key: Option<String>,
    pub http_timeout: Duration,
}

impl ChatApiDefaults {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// `CHAT_API_BASE` is required; there is no provider to fall back to.
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let api_base = non_empty(API_BASE_ENV).ok_or_else(|| {
            RelayError::validation(format!("{API_BASE_ENV} must name the chat API base url"))
        })?;
        Ok(Self {
            api_key: non_empty(API_KEY_ENV),
            ..Self::new(api_base.trim())
        })
    }
}

/// Adapter for an Evolution-style WhatsApp HTTP gateway.
///
/// With the `mock` feature an `api_base` of the form `mock://<scenario>`
/// short-circuits every call: `mock://fail` makes each call fail, any other
/// scenario succeeds. Without it such a base is rejected at construction.
pub struct ChatApiAdapter {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl ChatApiAdapter {
    pub fn new(defaults: &ChatApiDefaults) -> RelayResult<Self> {
        Self::build(defaults, defaults.api_base.clone(), defaults.api_key.clone())
    }

    /// Builds an adapter with its own HTTP client bound to `credentials`,
    /// falling back to the defaults for unset fields.
    pub fn with_credentials(
        defaults: &ChatApiDefaults,
        credentials: &Credentials,
    ) -> RelayResult<Self> {
        let api_base = credentials
            .api_base
            .clone()
            .unwrap_or_else(|| defaults.api_base.clone());
        let api_key = credentials
            .api_key
            .clone()
            .or_else(|| defaults.api_key.clone());
        Self::build(defaults, api_base, api_key)
    }

    fn build(
        defaults: &ChatApiDefaults,
        api_base: String,
        api_key: Option<String>,
    ) -> RelayResult<Self> {
        if api_base.starts_with(MOCK_SCHEME) && !mock_enabled() {
            return Err(RelayError::validation(format!(
                "{api_base}: mock chat api bases need the `mock` feature"
            )));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("relay-chat-api/", env!("CARGO_PKG_VERSION")))
            .timeout(defaults.http_timeout)
            .build()
            .map_err(|err| RelayError::provider(CHANNEL, format!("http client: {err}")))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn mock_scenario(&self) -> Option<&str> {
        self.api_base
            .strip_prefix(MOCK_SCHEME)
            .filter(|_| mock_enabled())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.api_base, path));
        match &self.api_key {
            Some(key) => builder.header("apikey", key),
            None => builder,
        }
    }

    /// Sends the request and returns the decoded body of a 2xx answer.
    async fn call(&self, operation: &str, builder: RequestBuilder) -> RelayResult<Value> {
        let (status, body) = self.execute(operation, builder).await?;
        if !status.is_success() {
            return Err(RelayError::provider(
                CHANNEL,
                format!("{operation}: status={} body={}", status.as_u16(), body),
            ));
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }

    async fn execute(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> RelayResult<(StatusCode, String)> {
        let response = builder
            .send()
            .await
            .map_err(|err| RelayError::provider(CHANNEL, format!("{operation}: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RelayError::provider(CHANNEL, format!("{operation} body: {err}")))?;
        debug!(operation, status = status.as_u16(), "chat api call finished");
        Ok((status, body))
    }

    async fn create_instance(&self, external_id: &str) -> RelayResult<()> {
        let builder = self.request(Method::POST, "instance/create").json(&json!({
            "instanceName": external_id,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        }));
        let (status, body) = self.execute("create instance", builder).await?;
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::CONFLICT || body.to_ascii_lowercase().contains("already") {
            info!(external_id, "instance already exists on provider");
            return Ok(());
        }
        Err(RelayError::provider(
            CHANNEL,
            format!("create instance: status={} body={}", status.as_u16(), body),
        ))
    }

    async fn handshake(&self, external_id: &str) -> RelayResult<ConnectOutcome> {
        let body = self
            .call(
                "connect",
                self.request(Method::GET, &format!("instance/connect/{external_id}")),
            )
            .await?;
        let state = body
            .pointer("/instance/state")
            .and_then(Value::as_str)
            .and_then(ConnectionStatus::from_provider_state);
        let qr_code = body
            .get("base64")
            .or_else(|| body.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(ConnectOutcome {
            status: state.unwrap_or(ConnectionStatus::Connecting),
            qr_code,
            message: body
                .get("pairingCode")
                .and_then(Value::as_str)
                .map(|code| format!("pairing code {code}")),
        })
    }
}

#[async_trait]
impl ChannelAdapter for ChatApiAdapter {
    fn channel(&self) -> &str {
        CHANNEL
    }

    async fn connect(
        &self,
        external_id: &str,
        _credentials: Option<&Credentials>,
        needs_create: bool,
    ) -> RelayResult<ConnectOutcome> {
        if let Some(scenario) = self.mock_scenario() {
            return Ok(match scenario {
                "fail" => ConnectOutcome::error("mock connect failure"),
                _ => ConnectOutcome {
                    status: ConnectionStatus::Connecting,
                    qr_code: Some(format!("mock-qr-{external_id}")),
                    message: None,
                },
            });
        }

        let result = async {
            if needs_create {
                self.create_instance(external_id).await?;
            }
            self.handshake(external_id).await
        }
        .await;
        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(external_id, error = %err, "chat api connect failed");
                Ok(ConnectOutcome::error(err.to_string()))
            }
        }
    }

    async fn disconnect(&self, external_id: &str) -> RelayResult<()> {
        if let Some(scenario) = self.mock_scenario() {
            return match scenario {
                "fail" => Err(RelayError::provider(CHANNEL, "mock disconnect failure")),
                _ => Ok(()),
            };
        }
        self.call(
            "logout",
            self.request(Method::DELETE, &format!("instance/logout/{external_id}")),
        )
        .await
        .map(|_| ())
    }

    async fn send_message(
        &self,
        external_id: &str,
        recipient: &str,
        body: &str,
        media: Option<&Media>,
    ) -> RelayResult<SendReceipt> {
        if let Some(scenario) = self.mock_scenario() {
            return match scenario {
                "fail" => Err(RelayError::provider(CHANNEL, "mock send failure")),
                _ => Ok(SendReceipt {
                    provider_message_id: Some(format!("mock-{}", uuid::Uuid::new_v4())),
                    timestamp: OffsetDateTime::now_utc(),
                }),
            };
        }

        let builder = match media {
            Some(media) => self
                .request(Method::POST, &format!("message/sendMedia/{external_id}"))
                .json(&json!({
                    "number": recipient,
                    "mediatype": media_type(media),
                    "media": media.url,
                    "mimetype": media.mime_type,
                    "fileName": media.file_name,
                    "caption": media.caption.clone().unwrap_or_else(|| body.to_string()),
                })),
            None => self
                .request(Method::POST, &format!("message/sendText/{external_id}"))
                .json(&json!({ "number": recipient, "text": body })),
        };
        let response = self.call("send", builder).await?;
        let timestamp = response
            .get("messageTimestamp")
            .and_then(timestamp_value)
            .unwrap_or_else(OffsetDateTime::now_utc);
        Ok(SendReceipt {
            provider_message_id: response
                .pointer("/key/id")
                .and_then(Value::as_str)
                .map(str::to_string),
            timestamp,
        })
    }

    async fn get_status(&self, external_id: &str) -> RelayResult<StatusReport> {
        if let Some(scenario) = self.mock_scenario() {
            let status = match scenario {
                "fail" => ConnectionStatus::Error,
                _ => ConnectionStatus::Connected,
            };
            return Ok(StatusReport {
                status,
                qr_code: None,
                is_ready: status == ConnectionStatus::Connected,
            });
        }
        let body = self
            .call(
                "connection state",
                self.request(
                    Method::GET,
                    &format!("instance/connectionState/{external_id}"),
                ),
            )
            .await?;
        let status = body
            .pointer("/instance/state")
            .or_else(|| body.get("state"))
            .and_then(Value::as_str)
            .and_then(ConnectionStatus::from_provider_state)
            .unwrap_or(ConnectionStatus::Pending);
        Ok(StatusReport {
            status,
            qr_code: None,
            is_ready: status == ConnectionStatus::Connected,
        })
    }

    fn translate_webhook(&self, raw: &Value) -> RelayResult<WebhookEvent> {
        translate(raw)
    }
}

/// Maps the provider webhook envelope `{event, instance, data}` onto a
/// canonical [`WebhookEvent`].
pub fn translate(raw: &Value) -> RelayResult<WebhookEvent> {
    let event = raw
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::validation("webhook payload has no event field"))?;
    let kind = event.trim().to_ascii_lowercase().replace('_', ".");
    let data = match raw.get("data") {
        Some(Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };

    let translated = match kind.as_str() {
        "connection.update" => data
            .get("state")
            .and_then(Value::as_str)
            .map(|state| WebhookEvent::ConnectionUpdate {
                state: state.to_string(),
            }),
        "messages.upsert" => {
            if data.pointer("/key/fromMe").and_then(Value::as_bool) == Some(true) {
                return Ok(WebhookEvent::OutboundEcho {
                    provider_message_id: data
                        .pointer("/key/id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            data.pointer("/key/remoteJid")
                .and_then(Value::as_str)
                .map(|jid| WebhookEvent::MessageReceived(inbound_message(jid, &data)))
        }
        "messages.update" => {
            let id = data
                .get("keyId")
                .or_else(|| data.pointer("/key/id"))
                .and_then(Value::as_str);
            let status = data.get("status").and_then(Value::as_str);
            id.zip(status)
                .map(|(id, status)| WebhookEvent::MessageStatus {
                    provider_message_id: id.to_string(),
                    status: status.to_string(),
                })
        }
        "qrcode.updated" => data
            .pointer("/qrcode/base64")
            .or_else(|| data.get("qrcode"))
            .and_then(Value::as_str)
            .map(|qr| WebhookEvent::QrCodeUpdated {
                qr_code: qr.to_string(),
            }),
        _ => None,
    };
    Ok(translated.unwrap_or(WebhookEvent::Ignored { kind }))
}

fn inbound_message(jid: &str, data: &Value) -> InboundMessage {
    let message = data.get("message").cloned().unwrap_or(Value::Null);
    let body = message
        .get("conversation")
        .or_else(|| message.pointer("/extendedTextMessage/text"))
        .or_else(|| message.pointer("/imageMessage/caption"))
        .or_else(|| message.pointer("/videoMessage/caption"))
        .or_else(|| message.pointer("/documentMessage/caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let media = ["imageMessage", "videoMessage", "audioMessage", "documentMessage"]
        .iter()
        .find_map(|kind| message.get(*kind))
        .and_then(|m| {
            Some(Media {
                url: m.get("url")?.as_str()?.to_string(),
                mime_type: m.get("mimetype").and_then(Value::as_str).map(str::to_string),
                caption: m.get("caption").and_then(Value::as_str).map(str::to_string),
                file_name: m.get("fileName").and_then(Value::as_str).map(str::to_string),
            })
        });
    InboundMessage {
        provider_message_id: data
            .pointer("/key/id")
            .and_then(Value::as_str)
            .map(str::to_string),
        from: strip_jid(jid).to_string(),
        body,
        media,
        timestamp: data.get("messageTimestamp").and_then(timestamp_value),
    }
}

fn mock_enabled() -> bool {
    cfg!(any(test, feature = "mock"))
}

fn strip_jid(jid: &str) -> &str {
    JID_SUFFIXES
        .iter()
        .find_map(|suffix| jid.strip_suffix(suffix))
        .unwrap_or(jid)
}

fn timestamp_value(value: &Value) -> Option<OffsetDateTime> {
    let secs = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

fn media_type(media: &Media) -> &'static str {
    match media.mime_type.as_deref() {
        Some(mime) if mime.starts_with("image/") => "image",
        Some(mime) if mime.starts_with("video/") => "video",
        Some(mime) if mime.starts_with("audio/") => "audio",
        _ => "document",
    }
}

/// Registers the chat API adapter. Calls without credentials share one
/// adapter built from `defaults`.
pub fn register(factory: &mut AdapterFactory, defaults: ChatApiDefaults) -> RelayResult<()> {
    let shared: Arc<dyn ChannelAdapter> = Arc::new(ChatApiAdapter::new(&defaults)?);
    factory.register(CHANNEL, move |credentials| {
        let adapter = match credentials {
            Some(creds) => ChatApiAdapter::with_credentials(&defaults, creds)?,
            None => ChatApiAdapter::new(&defaults)?,
        };
        Ok(Arc::new(adapter) as Arc<dyn ChannelAdapter>)
    })?;
    factory.with_shared(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock(scenario: &str) -> ChatApiAdapter {
        ChatApiAdapter::new(&ChatApiDefaults::new(format!("mock://{scenario}"))).unwrap()
    }

    #[test]
    fn api_base_is_required() {
        let err = ChatApiDefaults::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert!(err.to_string().contains("CHAT_API_BASE"));
        assert!(ChatApiDefaults::from_lookup(|_| Some("  ".into())).is_err());

        let defaults = ChatApiDefaults::from_lookup(|key| match key {
            "CHAT_API_BASE" => Some(" https://chat.example ".into()),
            "CHAT_API_KEY" => Some("secret".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(defaults.api_base, "https://chat.example");
        assert_eq!(defaults.api_key.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn mock_scenarios_short_circuit() {
        let ok = mock("chat-api");
        let receipt = ok.send_message("store-1", "5551234", "hi", None).await.unwrap();
        assert!(receipt.provider_message_id.unwrap().starts_with("mock-"));
        let outcome = ok.connect("store-1", None, true).await.unwrap();
        assert_eq!(outcome.status, ConnectionStatus::Connecting);
        assert_eq!(outcome.qr_code.as_deref(), Some("mock-qr-store-1"));

        let failing = mock("fail");
        let err = failing
            .send_message("store-1", "5551234", "hi", None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let outcome = failing.connect("store-1", None, true).await.unwrap();
        assert_eq!(outcome.status, ConnectionStatus::Error);
        assert_eq!(outcome.message.as_deref(), Some("mock connect failure"));
    }

    #[test]
    fn translates_connection_updates_in_either_casing() {
        let event = translate(&json!({
            "event": "CONNECTION_UPDATE",
            "instance": "store-1",
            "data": {"state": "open"}
        }))
        .unwrap();
        assert_eq!(
            event,
            WebhookEvent::ConnectionUpdate {
                state: "open".into()
            }
        );
    }

    #[test]
    fn translates_inbound_messages() {
        let event = translate(&json!({
            "event": "messages.upsert",
            "data": {
                "key": {"id": "ABC", "remoteJid": "5551234@s.whatsapp.net", "fromMe": false},
                "message": {"extendedTextMessage": {"text": "hello"}},
                "messageTimestamp": 1_700_000_000
            }
        }))
        .unwrap();
        let WebhookEvent::MessageReceived(inbound) = event else {
            panic!("expected inbound message");
        };
        assert_eq!(inbound.from, "5551234");
        assert_eq!(inbound.body, "hello");
        assert_eq!(inbound.provider_message_id.as_deref(), Some("ABC"));
        assert_eq!(
            inbound.timestamp.map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn own_echoes_only_signal_liveness() {
        let echo = translate(&json!({
            "event": "messages.upsert",
            "data": {"key": {"id": "X", "remoteJid": "1@s.whatsapp.net", "fromMe": true}}
        }))
        .unwrap();
        assert_eq!(
            echo,
            WebhookEvent::OutboundEcho {
                provider_message_id: Some("X".into())
            }
        );
        assert!(echo.is_message_activity());

        let other = translate(&json!({"event": "presence.update", "data": {}})).unwrap();
        assert_eq!(other.kind(), "presence.update");

        assert!(translate(&json!({"data": {}})).is_err());
    }

    #[test]
    fn translates_acks_and_qr_updates() {
        let ack = translate(&json!({
            "event": "messages.update",
            "data": [{"keyId": "ABC", "status": "DELIVERY_ACK"}]
        }))
        .unwrap();
        assert_eq!(
            ack,
            WebhookEvent::MessageStatus {
                provider_message_id: "ABC".into(),
                status: "DELIVERY_ACK".into()
            }
        );

        let qr = translate(&json!({
            "event": "QRCODE_UPDATED",
            "data": {"qrcode": {"base64": "data:image/png;base64,AAA"}}
        }))
        .unwrap();
        assert!(matches!(qr, WebhookEvent::QrCodeUpdated { .. }));
    }

    #[test]
    fn credential_overrides_build_distinct_adapters() {
        let mut factory = AdapterFactory::new();
        register(&mut factory, ChatApiDefaults::new("mock://chat-api")).unwrap();
        let shared = factory.resolve(CHANNEL, None).unwrap();
        let again = factory.resolve(CHANNEL, None).unwrap();
        assert!(Arc::ptr_eq(&shared, &again));

        let creds = Credentials {
            api_base: Some("mock://tenant".into()),
            api_key: Some("tenant-key".into()),
            ..Credentials::default()
        };
        let isolated = factory.resolve(CHANNEL, Some(&creds)).unwrap();
        assert!(!Arc::ptr_eq(&shared, &isolated));
    }
}
