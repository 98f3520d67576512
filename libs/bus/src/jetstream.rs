use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_nats::header::NATS_MESSAGE_ID;
use async_nats::jetstream::{
    self, AckKind, Context as JsContext,
    consumer::{AckPolicy, DeliverPolicy, pull::Config as PullConfig},
    context::Publish,
    stream::{Config as StreamConfig, RetentionPolicy},
};
use async_trait::async_trait;
use futures::StreamExt;
use relay_core::{DEAD_LETTER_WILDCARD, DEFAULT_SEND_TOPIC, consumer_name};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{BusError, DurableQueue, QueueDelivery, QueueHandler};

#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    pub stream: String,
    pub subjects: Vec<String>,
    pub duplicate_window: Duration,
    pub max_deliver: i64,
    pub ack_wait: Duration,
    /// Delay requested from the server when a handler asks for redelivery.
    pub redelivery_delay: Duration,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            stream: "RELAY".into(),
            subjects: vec![DEFAULT_SEND_TOPIC.into(), DEAD_LETTER_WILDCARD.into()],
            duplicate_window: Duration::from_secs(120),
            max_deliver: 10,
            ack_wait: Duration::from_secs(60),
            redelivery_delay: Duration::from_secs(5),
        }
    }
}

/// Durable queue over a single JetStream stream.
pub struct JetStreamQueue {
    client: async_nats::Client,
    js: JsContext,
    config: JetStreamConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JetStreamQueue {
    pub async fn connect(url: &str, config: JetStreamConfig) -> anyhow::Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("connect to NATS at {url}"))?;
        Self::new(client, config).await
    }

    pub async fn new(client: async_nats::Client, config: JetStreamConfig) -> anyhow::Result<Self> {
        let js = jetstream::new(client.clone());
        js.get_or_create_stream(StreamConfig {
            name: config.stream.clone(),
            subjects: config.subjects.clone(),
            retention: RetentionPolicy::WorkQueue,
            duplicate_window: config.duplicate_window,
            max_messages: -1,
            max_messages_per_subject: -1,
            max_bytes: -1,
            description: Some("Relay outbound sends and dead letters".into()),
            ..Default::default()
        })
        .await
        .with_context(|| format!("create stream {}", config.stream))?;
        info!(stream = %config.stream, subjects = ?config.subjects, "jetstream queue ready");

        Ok(Self {
            client,
            js,
            config,
            workers: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DurableQueue for JetStreamQueue {
    async fn publish(&self, topic: &str, event: Value, key: Option<&str>) -> Result<(), BusError> {
        let payload = serde_json::to_vec(&event)?;
        let mut publish = Publish::build().payload(payload.into());
        if let Some(key) = key {
            publish = publish.message_id(key);
        }
        let ack = self
            .js
            .send_publish(topic.to_string(), publish)
            .await
            .map_err(|err| BusError::publish(topic, err))?;
        let ack = ack.await.map_err(|err| BusError::publish(topic, err))?;
        if ack.duplicate {
            debug!(topic, key, "duplicate publish suppressed by stream");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<(), BusError> {
        let stream = self
            .js
            .get_stream(&self.config.stream)
            .await
            .map_err(|err| BusError::subscribe(topic, err))?;
        let durable = consumer_name(topic);
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                PullConfig {
                    durable_name: Some(durable.clone()),
                    filter_subject: topic.to_string(),
                    deliver_policy: DeliverPolicy::All,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| BusError::subscribe(topic, err))?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|err| BusError::subscribe(topic, err))?;

        info!(topic, consumer = %durable, "jetstream consumer attached");
        let redelivery_delay = self.config.redelivery_delay;
        let topic = topic.to_string();
        let worker = tokio::spawn(async move {
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(topic = %topic, error = %err, "missing message from JetStream");
                        continue;
                    }
                };
                let payload: Value = match serde_json::from_slice(&message.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        // undecodable events can never succeed
                        warn!(topic = %topic, error = %err, "dropping malformed queue payload");
                        if let Err(err) = message.ack_with(AckKind::Term).await {
                            warn!(error = %err, "failed to terminate delivery");
                        }
                        continue;
                    }
                };
                let attempt = message
                    .info()
                    .map(|info| info.delivered.max(1) as u32)
                    .unwrap_or(1);
                let key = message
                    .headers
                    .as_ref()
                    .and_then(|headers| headers.get(NATS_MESSAGE_ID))
                    .map(|value| value.as_str().to_string());
                let delivery = QueueDelivery {
                    topic: topic.clone(),
                    key,
                    payload,
                    attempt,
                };
                let outcome = match handler.handle(delivery).await {
                    Ok(()) => message.ack().await,
                    Err(err) => {
                        warn!(
                            topic = %topic,
                            attempt,
                            error = %err,
                            "handler failed; requesting redelivery"
                        );
                        message
                            .ack_with(AckKind::Nak(Some(redelivery_delay)))
                            .await
                    }
                };
                if let Err(err) = outcome {
                    warn!(topic = %topic, error = %err, "failed to ack delivery");
                }
            }
            info!(topic = %topic, "jetstream consumer stopped");
        });
        self.workers.lock().await.push(worker);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
        self.client
            .flush()
            .await
            .map_err(|err| BusError::publish("flush", err))?;
        Ok(())
    }
}
