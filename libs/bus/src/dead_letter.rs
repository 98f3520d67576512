//! Dead-letter records for sends that exhausted their retry budget.

use std::sync::Arc;

use relay_core::dead_letter_topic;
use relay_telemetry::{DEAD_LETTERS, TelemetryLabels, record_counter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;

use crate::{BusError, DurableQueue};

/// Error metadata stored alongside each dead letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub stage: Option<String>,
}

/// Payload stored for each dead letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub owner_id: String,
    pub channel: String,
    pub message_id: String,
    pub retries: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub error: DeadLetterError,
    pub envelope: Value,
}

#[derive(Clone)]
pub struct DeadLetterPublisher {
    queue: Arc<dyn DurableQueue>,
    stage: String,
    enabled: bool,
}

impl DeadLetterPublisher {
    pub fn new(stage: impl Into<String>, queue: Arc<dyn DurableQueue>, enabled: bool) -> Self {
        Self {
            queue,
            stage: stage.into(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn publish<S: Serialize>(
        &self,
        owner_id: &str,
        channel: &str,
        message_id: &str,
        retries: u32,
        error: DeadLetterError,
        envelope: &S,
    ) -> Result<(), BusError> {
        if !self.enabled {
            return Ok(());
        }

        let record = DeadLetterRecord {
            owner_id: owner_id.to_string(),
            channel: channel.to_string(),
            message_id: message_id.to_string(),
            retries,
            ts: OffsetDateTime::now_utc(),
            error: DeadLetterError {
                stage: Some(self.stage.clone()),
                ..error
            },
            envelope: serde_json::to_value(envelope)?,
        };
        let topic = dead_letter_topic(owner_id, channel);
        self.queue
            .publish(&topic, serde_json::to_value(&record)?, Some(message_id))
            .await?;

        let labels = TelemetryLabels::new(owner_id)
            .channel(channel)
            .with("stage", self.stage.clone())
            .with("code", record.error.code.clone());
        record_counter(DEAD_LETTERS, 1, &labels);
        info!(
            owner_id = %record.owner_id,
            channel = %record.channel,
            message_id = %record.message_id,
            code = %record.error.code,
            topic = %topic,
            "dead letter published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryQueue;
    use serde_json::json;
    use tracing_test::traced_test;

    fn error() -> DeadLetterError {
        DeadLetterError {
            code: "E_PROVIDER".into(),
            message: "provider returned 500".into(),
            stage: None,
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn publishes_to_tenant_channel_topic() {
        let queue = InMemoryQueue::default();
        let publisher = DeadLetterPublisher::new("send", Arc::new(queue.clone()), true);
        publisher
            .publish("owner-1", "whatsapp", "msg-1", 3, error(), &json!({"to": "5551234"}))
            .await
            .unwrap();

        let published = queue.take_published().await;
        assert_eq!(published.len(), 1);
        let (topic, payload) = &published[0];
        assert_eq!(topic, "relay.msg.dlq.owner-1.whatsapp");
        let record: DeadLetterRecord = serde_json::from_value(payload.clone()).unwrap();
        assert_eq!(record.retries, 3);
        assert_eq!(record.error.stage.as_deref(), Some("send"));
        assert_eq!(record.envelope["to"], "5551234");
        assert!(logs_contain("dead letter published"));
    }

    #[tokio::test]
    async fn disabled_publisher_is_a_noop() {
        let queue = InMemoryQueue::default();
        let publisher = DeadLetterPublisher::new("send", Arc::new(queue.clone()), false);
        publisher
            .publish("owner-1", "whatsapp", "msg-1", 3, error(), &json!({}))
            .await
            .unwrap();
        assert!(queue.take_published().await.is_empty());
    }
}
