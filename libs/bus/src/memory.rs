use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::{BusError, DurableQueue, QueueDelivery, QueueHandler};

const DEFAULT_MAX_DELIVERIES: u32 = 5;
const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

type Pending = (Option<String>, Value);

struct Inner {
    /// One ordered feed per subscribed topic.
    feeds: Mutex<HashMap<String, mpsc::UnboundedSender<Pending>>>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    backlog: Mutex<HashMap<String, Vec<Pending>>>,
    published: Mutex<Vec<(String, Value)>>,
    /// `topic:key` to the moment it was first accepted.
    seen_keys: Mutex<HashMap<String, Instant>>,
    /// Events handed to a worker and not yet settled.
    outstanding: Arc<watch::Sender<usize>>,
    redelivery_delay: Duration,
    max_deliveries: u32,
    duplicate_window: Duration,
    closed: AtomicBool,
}

/// Process-local queue with the same delivery contract as JetStream.
///
/// Each subscribed topic is drained by a single worker, so a handler sees one
/// delivery at a time and a redelivery holds back later events on its topic.
/// Events published before a handler subscribes are buffered and handed over
/// on subscription.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::ZERO, DEFAULT_MAX_DELIVERIES)
    }
}

impl InMemoryQueue {
    pub fn new(redelivery_delay: Duration, max_deliveries: u32) -> Self {
        Self::with_duplicate_window(redelivery_delay, max_deliveries, DEFAULT_DUPLICATE_WINDOW)
    }

    /// Keys are remembered for `duplicate_window` after first being accepted.
    pub fn with_duplicate_window(
        redelivery_delay: Duration,
        max_deliveries: u32,
        duplicate_window: Duration,
    ) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                feeds: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                backlog: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                seen_keys: Mutex::new(HashMap::new()),
                outstanding: Arc::new(outstanding),
                redelivery_delay,
                max_deliveries: max_deliveries.max(1),
                duplicate_window,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Everything published so far, draining the record.
    pub async fn take_published(&self) -> Vec<(String, Value)> {
        let mut guard = self.inner.published.lock().await;
        std::mem::take(&mut *guard)
    }

    /// Waits until every handed-over event, including redeliveries and events
    /// published by handlers, has been settled.
    pub async fn flush(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        if outstanding.wait_for(|n| *n == 0).await.is_err() {
            warn!("in-memory queue dropped while flushing");
        }
    }

    /// Accepts `topic:key` unless it was seen within the window. Expired
    /// keys are forgotten on the way.
    async fn accept_key(&self, topic: &str, key: &str) -> bool {
        let window = self.inner.duplicate_window;
        let mut seen = self.inner.seen_keys.lock().await;
        seen.retain(|_, at| at.elapsed() < window);
        match seen.entry(format!("{topic}:{key}")) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    fn hand_over(
        &self,
        feed: &mpsc::UnboundedSender<Pending>,
        topic: &str,
        event: Pending,
    ) -> Result<(), BusError> {
        self.inner.outstanding.send_modify(|n| *n += 1);
        if feed.send(event).is_err() {
            self.inner.outstanding.send_modify(|n| *n -= 1);
            warn!(topic = %topic, "topic worker is gone; event dropped");
            return Err(BusError::Disconnected);
        }
        Ok(())
    }

    /// Starts the worker that drains `topic` in publish order.
    async fn start_worker(
        &self,
        topic: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> mpsc::UnboundedSender<Pending> {
        let (feed, mut events) = mpsc::unbounded_channel::<Pending>();
        let outstanding = Arc::clone(&self.inner.outstanding);
        let delay = self.inner.redelivery_delay;
        let max = self.inner.max_deliveries;
        let worker_topic = topic.to_string();
        let worker = tokio::spawn(async move {
            while let Some((key, payload)) = events.recv().await {
                deliver(&worker_topic, handler.as_ref(), key, payload, delay, max).await;
                outstanding.send_modify(|n| *n -= 1);
            }
        });
        // a replaced worker drains what it already holds and exits
        self.inner
            .workers
            .lock()
            .await
            .insert(topic.to_string(), worker);
        feed
    }
}

/// Delivers one event until it is acknowledged or its budget is spent.
async fn deliver(
    topic: &str,
    handler: &dyn QueueHandler,
    key: Option<String>,
    payload: Value,
    delay: Duration,
    max: u32,
) {
    for attempt in 1..=max {
        let delivery = QueueDelivery {
            topic: topic.to_string(),
            key: key.clone(),
            payload: payload.clone(),
            attempt,
        };
        match handler.handle(delivery).await {
            Ok(()) => return,
            Err(err) if attempt < max => {
                warn!(
                    topic = %topic,
                    attempt,
                    error = %err,
                    "delivery failed; redelivering"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(topic = %topic, attempt, error = %err, "delivery budget exhausted");
            }
        }
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn publish(&self, topic: &str, event: Value, key: Option<&str>) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        if let Some(key) = key {
            if !self.accept_key(topic, key).await {
                return Ok(());
            }
        }
        self.inner
            .published
            .lock()
            .await
            .push((topic.to_string(), event.clone()));

        let pending = (key.map(str::to_string), event);
        // held across the backlog push so a concurrent subscribe cannot miss it
        let feeds = self.inner.feeds.lock().await;
        match feeds.get(topic) {
            Some(feed) => self.hand_over(feed, topic, pending)?,
            None => self
                .inner
                .backlog
                .lock()
                .await
                .entry(topic.to_string())
                .or_default()
                .push(pending),
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        let feed = self.start_worker(topic, handler).await;
        let mut feeds = self.inner.feeds.lock().await;
        let backlog = self
            .inner
            .backlog
            .lock()
            .await
            .remove(topic)
            .unwrap_or_default();
        for pending in backlog {
            self.hand_over(&feed, topic, pending)?;
        }
        feeds.insert(topic.to_string(), feed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.flush().await;
        self.inner.feeds.lock().await.clear();
        let workers: Vec<_> = self.inner.workers.lock().await.drain().collect();
        for (topic, worker) in workers {
            if let Err(err) = worker.await {
                warn!(topic = %topic, error = %err, "in-memory topic worker aborted");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct FlakyHandler {
        fail_until: u32,
        calls: AtomicU32,
        attempts_seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl QueueHandler for FlakyHandler {
        async fn handle(&self, delivery: QueueDelivery) -> anyhow::Result<()> {
            self.attempts_seen.lock().await.push(delivery.attempt);
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_until {
                anyhow::bail!("transient failure {call}");
            }
            Ok(())
        }
    }

    fn flaky(fail_until: u32) -> Arc<FlakyHandler> {
        Arc::new(FlakyHandler {
            fail_until,
            calls: AtomicU32::new(0),
            attempts_seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn failed_handlers_are_redelivered_with_increasing_attempts() {
        let queue = InMemoryQueue::new(Duration::ZERO, 5);
        let handler = flaky(2);
        queue.subscribe("relay.msg.send", handler.clone()).await.unwrap();
        queue
            .publish("relay.msg.send", json!({"message_id": "m1"}), Some("m1"))
            .await
            .unwrap();
        queue.flush().await;
        assert_eq!(*handler.attempts_seen.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn delivery_stops_at_budget() {
        let queue = InMemoryQueue::new(Duration::ZERO, 2);
        let handler = flaky(10);
        queue.subscribe("t", handler.clone()).await.unwrap();
        queue.publish("t", json!({}), None).await.unwrap();
        queue.flush().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_keys_are_accepted_once() {
        let queue = InMemoryQueue::default();
        let handler = flaky(0);
        queue.subscribe("t", handler.clone()).await.unwrap();
        queue.publish("t", json!({"n": 1}), Some("k")).await.unwrap();
        queue.publish("t", json!({"n": 2}), Some("k")).await.unwrap();
        queue.flush().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.take_published().await.len(), 1);
    }

    #[tokio::test]
    async fn backlog_is_delivered_on_subscribe() {
        let queue = InMemoryQueue::default();
        queue.publish("t", json!({"n": 1}), None).await.unwrap();
        let handler = flaky(0);
        queue.subscribe("t", handler.clone()).await.unwrap();
        queue.flush().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    /// Records how many deliveries overlap and the order payloads arrive in.
    #[derive(Default)]
    struct OverlapRecorder {
        active: AtomicU32,
        max_active: AtomicU32,
        order: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl QueueHandler for OverlapRecorder {
        async fn handle(&self, delivery: QueueDelivery) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.order.lock().await.push(delivery.payload);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_topic_is_delivered_one_event_at_a_time_in_order() {
        let queue = InMemoryQueue::default();
        let handler = Arc::new(OverlapRecorder::default());
        queue.subscribe("t", handler.clone()).await.unwrap();
        for n in 0..8 {
            queue.publish("t", json!({"n": n}), None).await.unwrap();
        }
        queue.flush().await;

        assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
        let order: Vec<Value> = (0..8).map(|n| json!({"n": n})).collect();
        assert_eq!(*handler.order.lock().await, order);
    }

    #[tokio::test]
    async fn keys_are_accepted_again_after_the_window() {
        let queue = InMemoryQueue::with_duplicate_window(Duration::ZERO, 5, Duration::ZERO);
        let handler = flaky(0);
        queue.subscribe("t", handler.clone()).await.unwrap();
        queue.publish("t", json!({"n": 1}), Some("k")).await.unwrap();
        queue.publish("t", json!({"n": 2}), Some("k")).await.unwrap();
        queue.flush().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(queue.inner.seen_keys.lock().await.len() <= 1);
    }

    #[tokio::test]
    async fn disconnect_settles_and_stops_workers() {
        let queue = InMemoryQueue::default();
        let handler = flaky(1);
        queue.subscribe("t", handler.clone()).await.unwrap();
        queue.publish("t", json!({}), None).await.unwrap();
        queue.disconnect().await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(queue.inner.workers.lock().await.is_empty());
        assert!(queue.inner.feeds.lock().await.is_empty());
    }

    #[tokio::test]
    async fn publish_after_disconnect_fails() {
        let queue = InMemoryQueue::default();
        queue.disconnect().await.unwrap();
        let err = queue.publish("t", json!({}), None).await.unwrap_err();
        assert!(matches!(err, BusError::Disconnected));
    }
}
