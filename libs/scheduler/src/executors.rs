//! Executors for the built-in action types.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use relay_core::{RelayError, RelayResult};
use relay_dispatch::{DispatchService, SendRequest};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::debug;

use crate::action::{
    API_CALL, ApiCallPayload, PROVIDER_MESSAGE_SEND, ProviderMessagePayload, WEBHOOK_CALL,
    WebhookCallPayload, decode, require_field,
};
use crate::executor::{ActionContext, ActionExecutor, ActionFactory};

pub const SIGNATURE_HEADER: &str = "X-Relay-Signature";

/// `sha256=<hex>` HMAC of `body` under `secret`.
///
/// ```
/// let sig = relay_scheduler::sign_body("topsecret", br#"{"ok":true}"#).unwrap();
/// assert!(sig.starts_with("sha256="));
/// assert_eq!(sig.len(), "sha256=".len() + 64);
/// ```
pub fn sign_body(secret: &str, body: &[u8]) -> RelayResult<String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| RelayError::validation(format!("invalid signing secret: {err}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

pub struct ProviderMessageExecutor {
    dispatch: Arc<DispatchService>,
}

impl ProviderMessageExecutor {
    pub fn new(dispatch: Arc<DispatchService>) -> Self {
        Self { dispatch }
    }
}

#[async_trait]
impl ActionExecutor for ProviderMessageExecutor {
    async fn execute(&self, ctx: &ActionContext, payload: &Value) -> RelayResult<Value> {
        let payload: ProviderMessagePayload = decode(PROVIDER_MESSAGE_SEND, payload)?;
        require_field(PROVIDER_MESSAGE_SEND, "channel", &payload.channel)?;
        require_field(PROVIDER_MESSAGE_SEND, "external_id", &payload.external_id)?;
        require_field(PROVIDER_MESSAGE_SEND, "recipient", &payload.recipient)?;
        if payload.body.trim().is_empty() && payload.media.is_none() {
            return Err(RelayError::validation(format!(
                "{PROVIDER_MESSAGE_SEND} payload requires `body` or `media`"
            )));
        }
        let outcome = self
            .dispatch
            .send(SendRequest {
                owner_id: ctx.owner_id.clone(),
                channel: payload.channel,
                external_id: payload.external_id,
                recipient: payload.recipient,
                body: payload.body,
                media: payload.media,
            })
            .await?;
        serde_json::to_value(outcome).map_err(RelayError::storage)
    }
}

pub struct ApiCallExecutor {
    http: Client,
}

impl ApiCallExecutor {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ActionExecutor for ApiCallExecutor {
    async fn execute(&self, ctx: &ActionContext, payload: &Value) -> RelayResult<Value> {
        let payload: ApiCallPayload = decode(API_CALL, payload)?;
        require_field(API_CALL, "url", &payload.url)?;
        let method = Method::from_bytes(payload.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                RelayError::validation(format!(
                    "{API_CALL} has invalid method `{}`",
                    payload.method
                ))
            })?;

        let mut request = self.http.request(method, &payload.url);
        for (name, value) in &payload.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &payload.body {
            request = request.json(body);
        }
        debug!(action_id = %ctx.action_id, url = %payload.url, "api call");
        perform(API_CALL, request).await
    }
}

pub struct WebhookCallExecutor {
    http: Client,
}

impl WebhookCallExecutor {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ActionExecutor for WebhookCallExecutor {
    async fn execute(&self, ctx: &ActionContext, payload: &Value) -> RelayResult<Value> {
        let payload: WebhookCallPayload = decode(WEBHOOK_CALL, payload)?;
        require_field(WEBHOOK_CALL, "url", &payload.url)?;
        let body = serde_json::to_vec(&payload.body)
            .map_err(|err| RelayError::validation(format!("{WEBHOOK_CALL} body: {err}")))?;

        let mut request = self
            .http
            .post(&payload.url)
            .header("content-type", "application/json");
        for (name, value) in &payload.headers {
            request = request.header(name, value);
        }
        if let Some(secret) = payload.secret.as_deref().filter(|s| !s.is_empty()) {
            request = request.header(SIGNATURE_HEADER, sign_body(secret, &body)?);
        }
        debug!(action_id = %ctx.action_id, url = %payload.url, "webhook call");
        perform(WEBHOOK_CALL, request.body(body)).await
    }
}

/// Sends the request; non-2xx answers are failures carrying the response text.
async fn perform(action_type: &str, request: RequestBuilder) -> RelayResult<Value> {
    let response = request
        .send()
        .await
        .map_err(|err| RelayError::provider(action_type, err.to_string()))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| RelayError::provider(action_type, err.to_string()))?;
    if !status.is_success() {
        return Err(RelayError::provider(
            action_type,
            format!("http {}: {}", status.as_u16(), text),
        ));
    }
    let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
    Ok(json!({"status": status.as_u16(), "body": body}))
}

impl ActionFactory {
    /// Factory with the three built-in action types registered.
    pub fn standard(dispatch: Arc<DispatchService>, http: Client) -> RelayResult<Self> {
        let mut factory = ActionFactory::new();
        let api_http = http.clone();
        factory.register(PROVIDER_MESSAGE_SEND, move || {
            Arc::new(ProviderMessageExecutor::new(dispatch.clone())) as Arc<dyn ActionExecutor>
        })?;
        factory.register(API_CALL, move || {
            Arc::new(ApiCallExecutor::new(api_http.clone())) as Arc<dyn ActionExecutor>
        })?;
        factory.register(WEBHOOK_CALL, move || {
            Arc::new(WebhookCallExecutor::new(http.clone())) as Arc<dyn ActionExecutor>
        })?;
        Ok(factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex() {
        let a = sign_body("k", b"{}").unwrap();
        let b = sign_body("k", b"{}").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, sign_body("other", b"{}").unwrap());
        assert!(
            a.trim_start_matches("sha256=")
                .chars()
                .all(|c| c.is_ascii_hexdigit())
        );
    }

    #[tokio::test]
    async fn invalid_payloads_fail_before_any_request() {
        let ctx = ActionContext {
            owner_id: "owner-1".into(),
            action_id: "a-1".into(),
        };
        let executor = WebhookCallExecutor::new(Client::new());
        let err = executor
            .execute(&ctx, &json!({"url": "  ", "body": {}}))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let executor = ApiCallExecutor::new(Client::new());
        let err = executor
            .execute(&ctx, &json!({"url": "http://localhost:1", "method": "NOT A METHOD"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }
}
