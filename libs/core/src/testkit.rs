//! Test doubles shared by the relay crates. Enabled with the `testkit` feature.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::adapter::{ChannelAdapter, ConnectOutcome, SendReceipt, StatusReport, WebhookEvent};
use crate::error::{RelayError, RelayResult};
use crate::factory::AdapterFactory;
use crate::types::{ConnectionStatus, Credentials, Media};

/// A send observed by [`ScriptedAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSend {
    pub external_id: String,
    pub recipient: String,
    pub body: String,
    pub media: Option<Media>,
}

#[derive(Default)]
struct Script {
    fail_first: usize,
    failing_recipients: HashSet<String>,
    connect: Option<ConnectOutcome>,
    status: Option<StatusReport>,
    sends: Vec<RecordedSend>,
    connects: Vec<(String, bool)>,
    disconnects: Vec<String>,
}

/// Adapter whose behaviour is scripted by the test.
///
/// Webhook payloads are expected to already be in the canonical tagged
/// [`WebhookEvent`] form.
#[derive(Clone)]
pub struct ScriptedAdapter {
    channel: String,
    script: Arc<Mutex<Script>>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedAdapter {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            script: Arc::new(Mutex::new(Script::default())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The first `n` send attempts fail with a provider error.
    pub fn fail_first_sends(self, n: usize) -> Self {
        self.script().fail_first = n;
        self
    }

    /// Every send to `recipient` fails with a provider error.
    pub fn fail_recipient(self, recipient: impl Into<String>) -> Self {
        self.script().failing_recipients.insert(recipient.into());
        self
    }

    pub fn with_connect_outcome(self, outcome: ConnectOutcome) -> Self {
        self.script().connect = Some(outcome);
        self
    }

    pub fn with_status(self, report: StatusReport) -> Self {
        self.script().status = Some(report);
        self
    }

    /// Number of send attempts, failed ones included.
    pub fn send_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful sends in call order.
    pub fn sends(&self) -> Vec<RecordedSend> {
        self.script().sends.clone()
    }

    pub fn connects(&self) -> Vec<(String, bool)> {
        self.script().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.script().disconnects.clone()
    }

    /// Factory with this adapter registered as the shared instance for its channel.
    pub fn into_factory(self) -> AdapterFactory {
        let builder = self.clone();
        AdapterFactory::single(
            Arc::new(self),
            Arc::new(move |_creds| Ok(Arc::new(builder.clone()) as Arc<dyn ChannelAdapter>)),
        )
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn connect(
        &self,
        external_id: &str,
        _credentials: Option<&Credentials>,
        needs_create: bool,
    ) -> RelayResult<ConnectOutcome> {
        let mut script = self.script();
        script.connects.push((external_id.to_string(), needs_create));
        Ok(script.connect.clone().unwrap_or(ConnectOutcome {
            status: ConnectionStatus::Connecting,
            qr_code: Some(format!("qr-{external_id}")),
            message: None,
        }))
    }

    async fn disconnect(&self, external_id: &str) -> RelayResult<()> {
        self.script().disconnects.push(external_id.to_string());
        Ok(())
    }

    async fn send_message(
        &self,
        external_id: &str,
        recipient: &str,
        body: &str,
        media: Option<&Media>,
    ) -> RelayResult<SendReceipt> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script();
        if attempt < script.fail_first || script.failing_recipients.contains(recipient) {
            return Err(RelayError::provider(
                self.channel.clone(),
                format!("scripted failure for {recipient}"),
            ));
        }
        script.sends.push(RecordedSend {
            external_id: external_id.to_string(),
            recipient: recipient.to_string(),
            body: body.to_string(),
            media: media.cloned(),
        });
        Ok(SendReceipt {
            provider_message_id: Some(format!("pm-{}", script.sends.len())),
            timestamp: OffsetDateTime::now_utc(),
        })
    }

    async fn get_status(&self, _external_id: &str) -> RelayResult<StatusReport> {
        Ok(self.script().status.clone().unwrap_or(StatusReport {
            status: ConnectionStatus::Connected,
            qr_code: None,
            is_ready: true,
        }))
    }

    fn translate_webhook(&self, raw: &Value) -> RelayResult<WebhookEvent> {
        serde_json::from_value(raw.clone())
            .map_err(|err| RelayError::validation(format!("unrecognized webhook: {err}")))
    }
}
