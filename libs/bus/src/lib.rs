//! Durable queue contract used between the dispatch service and send workers.
//!
//! Two implementations ship with the crate: [`JetStreamQueue`] backed by a NATS
//! JetStream stream with explicit acks, and [`InMemoryQueue`] for tests and
//! single-process runs. Both give at-least-once delivery: a handler returning
//! an error causes the event to be redelivered after a delay until the
//! delivery budget runs out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

mod dead_letter;
mod jetstream;
mod memory;

pub use dead_letter::{DeadLetterError, DeadLetterPublisher, DeadLetterRecord};
pub use jetstream::{JetStreamConfig, JetStreamQueue};
pub use memory::InMemoryQueue;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("failed to encode queue payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("queue connection is closed")]
    Disconnected,
}

impl BusError {
    pub(crate) fn publish(topic: &str, source: impl Into<anyhow::Error>) -> Self {
        BusError::Publish {
            topic: topic.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn subscribe(topic: &str, source: impl Into<anyhow::Error>) -> Self {
        BusError::Subscribe {
            topic: topic.to_string(),
            source: source.into(),
        }
    }
}

impl From<BusError> for relay_core::RelayError {
    fn from(err: BusError) -> Self {
        relay_core::RelayError::queue(err)
    }
}

/// One delivery of a queued event.
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Value,
    /// 1 for the first delivery, incremented on every redelivery.
    pub attempt: u32,
}

impl QueueDelivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Consumer side of a subscription. Returning `Err` requests redelivery.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, delivery: QueueDelivery) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Publishes an event. Events carrying the same `key` within the
    /// deduplication window are accepted once.
    async fn publish(&self, topic: &str, event: Value, key: Option<&str>) -> Result<(), BusError>;

    /// Attaches a handler to a topic; deliveries start immediately.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn QueueHandler>)
    -> Result<(), BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;
}

/// Shared trait object wrapper.
pub type SharedQueue = Arc<dyn DurableQueue>;

pub fn to_value<T: Serialize>(payload: &T) -> Result<Value, BusError> {
    Ok(serde_json::to_value(payload)?)
}
