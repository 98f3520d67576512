use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_bus::{DeadLetterError, DeadLetterPublisher, QueueDelivery, QueueHandler};
use relay_core::{
    AdapterFactory, MessageRepository, MessageStatus, QueueEvent, RelayError, RelayResult,
    SendReceipt, with_timeout,
};
use relay_telemetry::{
    ADAPTER_LATENCY, MESSAGES_FAILED, MESSAGES_RETRIED, MESSAGES_SENT, TelemetryLabels,
    record_counter, record_histogram,
};
use time::OffsetDateTime;
use tracing::{Instrument, debug, info, info_span, warn};

/// What a single delivery did to its message. Failures that should be
/// redelivered are returned as `Err` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Sent,
    /// The message already reached SENT or FAILED; redelivery is a no-op.
    AlreadyFinal(MessageStatus),
    /// No record exists for the event's message id.
    Missing,
    /// The retry budget is spent; the message is FAILED.
    Exhausted { retry_count: u32 },
    /// The failure cannot succeed on redelivery; the message is FAILED.
    Rejected { code: &'static str },
}

/// Drains the send topic, delivering each event through its channel adapter.
///
/// `retry_count` is incremented on every failed attempt. Once it reaches the
/// message's `max_retries` the message is marked FAILED and the event is
/// acknowledged; earlier failures are returned to the queue so it redelivers.
/// Errors that are not [`RelayError::is_retryable`] fail the message on the
/// first attempt.
pub struct SendConsumer {
    repo: Arc<dyn MessageRepository>,
    adapters: Arc<AdapterFactory>,
    adapter_timeout: Duration,
    dead_letters: Option<DeadLetterPublisher>,
}

impl SendConsumer {
    pub fn new(
        repo: Arc<dyn MessageRepository>,
        adapters: Arc<AdapterFactory>,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            adapters,
            adapter_timeout,
            dead_letters: None,
        }
    }

    pub fn with_dead_letters(mut self, publisher: DeadLetterPublisher) -> Self {
        self.dead_letters = Some(publisher);
        self
    }

    pub async fn process(&self, event: &QueueEvent) -> RelayResult<ProcessOutcome> {
        let Some(message) = self.repo.get_message_by_id(&event.message_id).await? else {
            warn!(message_id = %event.message_id, "queued message has no record; dropping");
            return Ok(ProcessOutcome::Missing);
        };
        if message.status.is_final() {
            debug!(
                message_id = %message.id,
                status = %message.status,
                "redelivery of finished message ignored"
            );
            return Ok(ProcessOutcome::AlreadyFinal(message.status));
        }

        self.repo
            .update_message_status(
                &message.id,
                MessageStatus::Processing,
                OffsetDateTime::now_utc(),
            )
            .await?;
        let labels = TelemetryLabels::new(&event.owner_id).channel(&event.channel);

        let started = Instant::now();
        let delivered = self.deliver(event).await;
        record_histogram(
            ADAPTER_LATENCY,
            started.elapsed().as_secs_f64(),
            &labels.clone().with("operation", "send_message"),
        );
        match delivered {
            Ok(receipt) => {
                if let Some(provider_id) = &receipt.provider_message_id {
                    self.repo
                        .update_message_provider_id(&message.id, provider_id)
                        .await?;
                }
                self.repo
                    .update_message_status(&message.id, MessageStatus::Sent, receipt.timestamp)
                    .await?;
                record_counter(MESSAGES_SENT, 1, &labels.with("mode", "queued"));
                info!(
                    owner_id = %event.owner_id,
                    message_id = %message.id,
                    retry_count = message.retry_count,
                    "queued message sent"
                );
                Ok(ProcessOutcome::Sent)
            }
            Err(err) => {
                let retry_count = message.retry_count + 1;
                self.repo
                    .update_message_error(&message.id, &err.to_string(), retry_count)
                    .await?;
                let rejected = !err.is_retryable();
                if rejected || retry_count >= message.max_retries {
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
                        &labels.with("mode", "queued").with("code", err.code()),
                    );
                    self.dead_letter(event, retry_count, &err).await;
                    if rejected {
                        warn!(
                            owner_id = %event.owner_id,
                            message_id = %message.id,
                            error = %err,
                            "send cannot succeed on redelivery; message failed"
                        );
                        return Ok(ProcessOutcome::Rejected { code: err.code() });
                    }
                    warn!(
                        owner_id = %event.owner_id,
                        message_id = %message.id,
                        retry_count,
                        error = %err,
                        "retry budget exhausted; message failed"
                    );
                    Ok(ProcessOutcome::Exhausted { retry_count })
                } else {
                    record_counter(MESSAGES_RETRIED, 1, &labels);
                    warn!(
                        owner_id = %event.owner_id,
                        message_id = %message.id,
                        retry_count,
                        max_retries = message.max_retries,
                        error = %err,
                        "send failed; awaiting redelivery"
                    );
                    Err(err)
                }
            }
        }
    }

    async fn deliver(&self, event: &QueueEvent) -> RelayResult<SendReceipt> {
        let adapter = self
            .adapters
            .resolve(&event.channel, event.credentials.as_ref())?;
        with_timeout(
            "send_message",
            self.adapter_timeout,
            adapter.send_message(
                &event.instance_external_id,
                &event.recipient,
                &event.body,
                event.media.as_ref(),
            ),
        )
        .await
    }

    async fn dead_letter(&self, event: &QueueEvent, retries: u32, err: &RelayError) {
        let Some(publisher) = &self.dead_letters else {
            return;
        };
        let error = DeadLetterError {
            code: err.code().to_string(),
            message: err.to_string(),
            stage: None,
        };
        if let Err(publish_err) = publisher
            .publish(
                &event.owner_id,
                &event.channel,
                &event.message_id,
                retries,
                error,
                event,
            )
            .await
        {
            warn!(
                message_id = %event.message_id,
                error = %publish_err,
                "dead letter publish failed"
            );
        }
    }
}

#[async_trait]
impl QueueHandler for SendConsumer {
    async fn handle(&self, delivery: QueueDelivery) -> anyhow::Result<()> {
        let event: QueueEvent = match delivery.decode() {
            Ok(event) => event,
            Err(err) => {
                // a payload that does not decode will never succeed
                warn!(topic = %delivery.topic, error = %err, "dropping malformed send event");
                return Ok(());
            }
        };
        let span = info_span!(
            "send_event",
            owner_id = tracing::field::Empty,
            instance_id = tracing::field::Empty,
            message_id = tracing::field::Empty,
            attempt = delivery.attempt,
        );
        relay_telemetry::with_common_fields(
            &span,
            &event.owner_id,
            Some(event.instance_id.as_str()),
            Some(event.message_id.as_str()),
        );
        self.process(&event).instrument(span).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_bus::InMemoryQueue;
    use relay_core::testkit::ScriptedAdapter;
    use relay_core::{InMemoryRepository, Instance, Message};

    async fn queued_message(repo: &InMemoryRepository, max_retries: u32) -> (Message, QueueEvent) {
        let instance = Instance::new("owner-1", "chatA", "store-1");
        let message = Message::outbound(
            &instance,
            "5551234",
            "hi",
            None,
            MessageStatus::Queued,
            max_retries,
        );
        repo.log_message(&message).await.unwrap();
        let event = QueueEvent::for_message(&message, &instance);
        (message, event)
    }

    fn consumer(repo: Arc<InMemoryRepository>, adapter: &ScriptedAdapter) -> SendConsumer {
        SendConsumer::new(
            repo,
            Arc::new(adapter.clone().into_factory()),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn redelivery_of_sent_message_is_a_noop() {
        let repo = Arc::new(InMemoryRepository::new());
        let adapter = ScriptedAdapter::new("chatA");
        let consumer = consumer(repo.clone(), &adapter);
        let (_, event) = queued_message(&repo, 3).await;

        assert_eq!(consumer.process(&event).await.unwrap(), ProcessOutcome::Sent);
        assert_eq!(
            consumer.process(&event).await.unwrap(),
            ProcessOutcome::AlreadyFinal(MessageStatus::Sent)
        );
        assert_eq!(adapter.send_attempts(), 1);
    }

    #[tokio::test]
    async fn failures_below_budget_request_redelivery() {
        let repo = Arc::new(InMemoryRepository::new());
        let adapter = ScriptedAdapter::new("chatA").fail_first_sends(1);
        let consumer = consumer(repo.clone(), &adapter);
        let (message, event) = queued_message(&repo, 3).await;

        let err = consumer.process(&event).await.unwrap_err();
        assert!(matches!(err, RelayError::Provider { .. }));
        let stored = repo.get_message_by_id(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, MessageStatus::Processing);
        assert!(stored.error.is_some());
    }

    #[tokio::test]
    async fn unregistered_channels_fail_without_redelivery() {
        let repo = Arc::new(InMemoryRepository::new());
        let adapter = ScriptedAdapter::new("chatA");
        let queue = InMemoryQueue::default();
        let consumer = consumer(repo.clone(), &adapter).with_dead_letters(
            DeadLetterPublisher::new("send", Arc::new(queue.clone()), true),
        );
        let (message, mut event) = queued_message(&repo, 3).await;
        event.channel = "sms".into();

        assert_eq!(
            consumer.process(&event).await.unwrap(),
            ProcessOutcome::Rejected {
                code: "E_ADAPTER_MISSING"
            }
        );
        let stored = repo.get_message_by_id(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(adapter.send_attempts(), 0);

        let published = queue.take_published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "relay.msg.dlq.owner-1.sms");
        assert_eq!(
            consumer.process(&event).await.unwrap(),
            ProcessOutcome::AlreadyFinal(MessageStatus::Failed)
        );
    }

    #[tokio::test]
    async fn missing_records_are_dropped() {
        let repo = Arc::new(InMemoryRepository::new());
        let adapter = ScriptedAdapter::new("chatA");
        let consumer = consumer(repo.clone(), &adapter);
        let instance = Instance::new("owner-1", "chatA", "store-1");
        let orphan = Message::outbound(&instance, "1", "x", None, MessageStatus::Queued, 3);
        let event = QueueEvent::for_message(&orphan, &instance);
        assert_eq!(consumer.process(&event).await.unwrap(), ProcessOutcome::Missing);
        assert_eq!(adapter.send_attempts(), 0);
    }
}
