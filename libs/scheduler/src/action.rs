//! Known action types and their payloads.

use std::collections::BTreeMap;

use relay_core::{Media, RelayError, RelayResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROVIDER_MESSAGE_SEND: &str = "provider_message_send";
pub const API_CALL: &str = "api_call";
pub const WEBHOOK_CALL: &str = "webhook_call";

/// Sends a message through an instance owned by the action's owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMessagePayload {
    pub channel: String,
    pub external_id: String,
    pub recipient: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallPayload {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "POST".into()
}

/// JSON POST to a caller supplied endpoint, signed when `secret` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookCallPayload {
    pub url: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Decodes an action payload, naming the action type in the error.
pub(crate) fn decode<T: DeserializeOwned>(action_type: &str, payload: &Value) -> RelayResult<T> {
    serde_json::from_value(payload.clone())
        .map_err(|err| RelayError::validation(format!("invalid {action_type} payload: {err}")))
}

pub(crate) fn require_field(action_type: &str, field: &str, value: &str) -> RelayResult<()> {
    if value.trim().is_empty() {
        return Err(RelayError::validation(format!(
            "{action_type} payload requires `{field}`"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_name_the_action_type() {
        let err = decode::<ApiCallPayload>(API_CALL, &json!({"method": "GET"})).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("api_call"), "{text}");
        assert!(text.contains("url"), "{text}");
    }

    #[test]
    fn api_call_defaults_to_post() {
        let payload: ApiCallPayload =
            decode(API_CALL, &json!({"url": "https://example.test/hook"})).unwrap();
        assert_eq!(payload.method, "POST");
        assert!(payload.headers.is_empty());
    }
}
