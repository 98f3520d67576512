use std::collections::BTreeMap;
use std::sync::Arc;

use relay_core::{
    AdapterFactory, ConnectionStatus, InboundMessage, Instance, Message, MessageStatus,
    RelayResult, Repository, WebhookEvent,
};
use relay_telemetry::{
    INSTANCE_SELF_HEALED, TelemetryLabels, WEBHOOK_EVENTS, record_counter, with_common_fields,
};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{Instrument, debug, info, info_span, warn};

/// Effect of one webhook on stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// At least one record changed.
    Applied,
    /// The event was understood but state already reflected it.
    Noop,
    /// The event was dropped; the reason is logged.
    Ignored(&'static str),
}

impl Reconciled {
    fn or(self, other: Reconciled) -> Reconciled {
        match (self, other) {
            (Reconciled::Applied, _) | (_, Reconciled::Applied) => Reconciled::Applied,
            (Reconciled::Noop, _) | (_, Reconciled::Noop) => Reconciled::Noop,
            (ignored, _) => ignored,
        }
    }
}

/// Folds provider webhooks into stored instance and message state.
///
/// Every branch is idempotent; replaying an event leaves state unchanged.
/// Errors are returned for logging only, providers are always acknowledged.
pub struct WebhookReconciler {
    repo: Arc<dyn Repository>,
    adapters: Arc<AdapterFactory>,
}

impl WebhookReconciler {
    pub fn new(repo: Arc<dyn Repository>, adapters: Arc<AdapterFactory>) -> Self {
        Self { repo, adapters }
    }

    /// Translates a raw provider payload with the channel's adapter and applies it.
    pub async fn handle_raw(
        &self,
        channel: &str,
        external_id: &str,
        raw: &Value,
    ) -> RelayResult<Reconciled> {
        let Some(instance) = self
            .repo
            .get_instance_by_channel_id(channel, external_id)
            .await?
        else {
            info!(channel, external_id, "webhook for unknown instance ignored");
            return Ok(Reconciled::Ignored("unknown instance"));
        };
        let adapter = self.adapters.resolve(channel, None)?;
        let event = match adapter.translate_webhook(raw) {
            Ok(event) => event,
            Err(err) => {
                warn!(channel, external_id, error = %err, "untranslatable webhook ignored");
                return Ok(Reconciled::Ignored("untranslatable payload"));
            }
        };
        self.apply(&instance, event).await
    }

    pub async fn apply(&self, instance: &Instance, event: WebhookEvent) -> RelayResult<Reconciled> {
        let span = info_span!(
            "webhook",
            kind = event.kind(),
            owner_id = tracing::field::Empty,
            instance_id = tracing::field::Empty,
            message_id = tracing::field::Empty,
        );
        with_common_fields(&span, &instance.owner_id, Some(instance.id.as_str()), None);
        record_counter(
            WEBHOOK_EVENTS,
            1,
            &TelemetryLabels::new(&instance.owner_id)
                .channel(&instance.channel)
                .with("kind", event.kind().to_string()),
        );
        self.dispatch(instance, event).instrument(span).await
    }

    async fn dispatch(&self, instance: &Instance, event: WebhookEvent) -> RelayResult<Reconciled> {
        let healed = if event.is_message_activity() {
            self.self_heal(instance).await?
        } else {
            Reconciled::Noop
        };
        let applied = match event {
            WebhookEvent::ConnectionUpdate { state } => {
                let Some(status) = ConnectionStatus::from_provider_state(&state) else {
                    warn!(state = %state, "unrecognized provider connection state dropped");
                    return Ok(Reconciled::Ignored("unrecognized connection state"));
                };
                self.set_status(instance, status).await?
            }
            WebhookEvent::MessageReceived(inbound) => self.record_inbound(instance, inbound).await?,
            WebhookEvent::MessageStatus {
                provider_message_id,
                status,
            } => {
                self.apply_ack(instance, &provider_message_id, &status)
                    .await?
            }
            WebhookEvent::QrCodeUpdated { qr_code } => self.store_qr(instance, qr_code).await?,
            WebhookEvent::OutboundEcho { provider_message_id } => {
                debug!(?provider_message_id, "own message echoed");
                Reconciled::Noop
            }
            WebhookEvent::Ignored { kind } => {
                debug!(kind = %kind, "provider event without state impact");
                return Ok(Reconciled::Ignored("event kind not tracked"));
            }
        };
        Ok(healed.or(applied))
    }

    async fn set_status(
        &self,
        instance: &Instance,
        status: ConnectionStatus,
    ) -> RelayResult<Reconciled> {
        if instance.status == status {
            return Ok(Reconciled::Noop);
        }
        self.repo
            .update_instance_status(&instance.id, status, OffsetDateTime::now_utc())
            .await?;
        info!(from = %instance.status, to = %status, "instance status updated");
        Ok(Reconciled::Applied)
    }

    /// Traffic proves the connection is live even when the connection event was lost.
    async fn self_heal(&self, instance: &Instance) -> RelayResult<Reconciled> {
        if instance.status == ConnectionStatus::Connected {
            return Ok(Reconciled::Noop);
        }
        self.repo
            .update_instance_status(
                &instance.id,
                ConnectionStatus::Connected,
                OffsetDateTime::now_utc(),
            )
            .await?;
        record_counter(
            INSTANCE_SELF_HEALED,
            1,
            &TelemetryLabels::new(&instance.owner_id).channel(&instance.channel),
        );
        info!(from = %instance.status, "message activity promoted instance to CONNECTED");
        Ok(Reconciled::Applied)
    }

    async fn record_inbound(
        &self,
        instance: &Instance,
        inbound: InboundMessage,
    ) -> RelayResult<Reconciled> {
        if let Some(provider_id) = &inbound.provider_message_id {
            if self
                .repo
                .get_message_by_provider_id(&instance.id, provider_id)
                .await?
                .is_some()
            {
                debug!(provider_message_id = %provider_id, "inbound message already recorded");
                return Ok(Reconciled::Noop);
            }
        }
        let message = Message::inbound(
            instance,
            inbound.from,
            inbound.body,
            inbound.media,
            inbound.provider_message_id,
            inbound.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
        );
        self.repo.log_message(&message).await?;
        info!(message_id = %message.id, from = %message.address, "inbound message recorded");
        Ok(Reconciled::Applied)
    }

    async fn apply_ack(
        &self,
        instance: &Instance,
        provider_message_id: &str,
        raw_status: &str,
    ) -> RelayResult<Reconciled> {
        let Some(next) = MessageStatus::from_provider_ack(raw_status) else {
            debug!(status = raw_status, "unrecognized ack status dropped");
            return Ok(Reconciled::Ignored("unrecognized ack status"));
        };
        let Some(message) = self
            .repo
            .get_message_by_provider_id(&instance.id, provider_message_id)
            .await?
        else {
            debug!(provider_message_id, "ack for unknown message dropped");
            return Ok(Reconciled::Ignored("unknown message"));
        };
        if !message.status.can_advance_to(next) {
            debug!(
                message_id = %message.id,
                current = %message.status,
                next = %next,
                "stale ack ignored"
            );
            return Ok(Reconciled::Noop);
        }
        let stored = self
            .repo
            .update_message_status(&message.id, next, OffsetDateTime::now_utc())
            .await?;
        if stored.is_none_or(|m| m.status != next) {
            debug!(message_id = %message.id, next = %next, "ack lost a race; status kept");
            return Ok(Reconciled::Noop);
        }
        info!(
            message_id = %message.id,
            from = %message.status,
            to = %next,
            "message status acknowledged"
        );
        Ok(Reconciled::Applied)
    }

    async fn store_qr(&self, instance: &Instance, qr_code: String) -> RelayResult<Reconciled> {
        let unchanged =
            instance.metadata.get("qr_code").and_then(Value::as_str) == Some(qr_code.as_str());
        let mut outcome = Reconciled::Noop;
        if !unchanged {
            let mut patch = BTreeMap::new();
            patch.insert("qr_code".to_string(), json!(qr_code));
            self.repo
                .update_instance_metadata(&instance.id, patch)
                .await?;
            outcome = Reconciled::Applied;
        }
        if !matches!(
            instance.status,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            outcome = outcome.or(self.set_status(instance, ConnectionStatus::Connecting).await?);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::testkit::ScriptedAdapter;
    use relay_core::{InMemoryRepository, InstanceRepository, MessageRepository};
    use tracing_test::traced_test;

    async fn setup(
        status: ConnectionStatus,
    ) -> (Arc<InMemoryRepository>, WebhookReconciler, Instance) {
        let repo = Arc::new(InMemoryRepository::new());
        let mut instance = Instance::new("owner-1", "chatA", "store-1");
        instance.status = status;
        repo.save_instance(&instance).await.unwrap();
        let reconciler = WebhookReconciler::new(
            repo.clone(),
            Arc::new(ScriptedAdapter::new("chatA").into_factory()),
        );
        (repo, reconciler, instance)
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_instances_are_logged_and_ignored() {
        let (_, reconciler, _) = setup(ConnectionStatus::Pending).await;
        let outcome = reconciler
            .handle_raw(
                "chatA",
                "store-404",
                &json!({"event": "connection_update", "state": "open"}),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Reconciled::Ignored("unknown instance"));
        assert!(logs_contain("webhook for unknown instance ignored"));
    }

    #[tokio::test]
    async fn unrecognized_connection_states_change_nothing() {
        let (repo, reconciler, instance) = setup(ConnectionStatus::Connecting).await;
        let outcome = reconciler
            .handle_raw(
                "chatA",
                "store-1",
                &json!({"event": "connection_update", "state": "pairing"}),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, Reconciled::Ignored(_)));
        let stored = repo.get_instance_by_id(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn stale_acks_do_not_move_status_backwards() {
        let (repo, reconciler, instance) = setup(ConnectionStatus::Connected).await;
        let mut message = Message::outbound(&instance, "555", "hi", None, MessageStatus::Read, 3);
        message.provider_message_id = Some("pm-9".into());
        repo.log_message(&message).await.unwrap();

        let outcome = reconciler
            .apply(
                &instance,
                WebhookEvent::MessageStatus {
                    provider_message_id: "pm-9".into(),
                    status: "delivery_ack".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, Reconciled::Noop);
        let stored = repo.get_message_by_id(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn own_echoes_heal_without_logging_a_message() {
        let (repo, reconciler, instance) = setup(ConnectionStatus::Disconnected).await;
        let echo = WebhookEvent::OutboundEcho {
            provider_message_id: Some("pm-1".into()),
        };

        let outcome = reconciler.apply(&instance, echo.clone()).await.unwrap();
        assert_eq!(outcome, Reconciled::Applied);
        let healed = repo.get_instance_by_id(&instance.id).await.unwrap().unwrap();
        assert_eq!(healed.status, ConnectionStatus::Connected);
        assert_eq!(repo.message_count().await, 0);

        let outcome = reconciler.apply(&healed, echo).await.unwrap();
        assert_eq!(outcome, Reconciled::Noop);
    }

    #[tokio::test]
    async fn qr_updates_are_stored_once() {
        let (repo, reconciler, instance) = setup(ConnectionStatus::Disconnected).await;
        let event = WebhookEvent::QrCodeUpdated {
            qr_code: "qr-1".into(),
        };
        assert_eq!(
            reconciler.apply(&instance, event.clone()).await.unwrap(),
            Reconciled::Applied
        );
        let stored = repo.get_instance_by_id(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Connecting);
        assert_eq!(stored.metadata["qr_code"], "qr-1");

        assert_eq!(
            reconciler.apply(&stored, event).await.unwrap(),
            Reconciled::Noop
        );
    }
}
