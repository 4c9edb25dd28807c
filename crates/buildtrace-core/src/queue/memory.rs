//! In-process reference transport.
//!
//! Honors the full contract (visibility-window redelivery, delivery ceiling,
//! dead-letter routing, immediate `nack` rejection) but holds everything in
//! memory. Durability across process restarts belongs to a real broker
//! behind the same traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    dead_letter_topic, Delivery, QueueConfig, QueueError, QueueTransport, Receipt, Subscription,
};

const SWEEP_INTERVAL: Duration = Duration::from_millis(20);

/// Shared receiver so multiple subscriptions compete for one topic's queue.
struct SharedReceiver<T> {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> SharedReceiver<T> {
    fn new_unbounded(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

struct QueuedMessage {
    payload: Bytes,
    /// Deliveries already made.
    deliveries: u32,
}

struct InflightEntry {
    topic: String,
    payload: Bytes,
    deliveries: u32,
    deadline: Instant,
}

struct DelayedEntry {
    topic: String,
    payload: Bytes,
    deliveries: u32,
    ready_at: Instant,
}

#[derive(Clone)]
struct TopicChannel {
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: SharedReceiver<QueuedMessage>,
    queued: Arc<AtomicUsize>,
}

struct TransportInner {
    config: QueueConfig,
    topics: Mutex<HashMap<String, TopicChannel>>,
    inflight: Mutex<HashMap<u64, InflightEntry>>,
    delayed: Mutex<Vec<DelayedEntry>>,
    next_receipt: AtomicU64,
    cancel: CancellationToken,
}

impl TransportInner {
    async fn channel(&self, topic: &str) -> TopicChannel {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                TopicChannel {
                    tx,
                    rx: SharedReceiver::new_unbounded(rx),
                    queued: Arc::new(AtomicUsize::new(0)),
                }
            })
            .clone()
    }

    async fn enqueue(&self, topic: &str, message: QueuedMessage) -> Result<(), QueueError> {
        let channel = self.channel(topic).await;
        channel.queued.fetch_add(1, Ordering::SeqCst);
        if channel.tx.send(message).is_err() {
            channel.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

/// In-memory transport with a background visibility sweeper.
pub struct MemoryTransport {
    inner: Arc<TransportInner>,
}

impl MemoryTransport {
    pub fn new(config: QueueConfig) -> Self {
        let inner = Arc::new(TransportInner {
            config,
            topics: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            delayed: Mutex::new(Vec::new()),
            next_receipt: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_sweeper(inner.clone(), inner.cancel.child_token()));
        Self { inner }
    }

    /// Stop deliveries and the sweeper. Queued messages are dropped.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Undelivered messages on `topic` (queued plus awaiting redelivery).
    pub async fn depth(&self, topic: &str) -> usize {
        let queued = match self.inner.topics.lock().await.get(topic) {
            Some(channel) => channel.queued.load(Ordering::SeqCst),
            None => 0,
        };
        let delayed = self
            .inner
            .delayed
            .lock()
            .await
            .iter()
            .filter(|entry| entry.topic == topic)
            .count();
        queued + delayed
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), QueueError> {
        if self.inner.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        self.inner
            .enqueue(
                topic,
                QueuedMessage {
                    payload,
                    deliveries: 0,
                },
            )
            .await
    }

    async fn subscribe(&self, topic: &str) -> Result<Arc<dyn Subscription>, QueueError> {
        if self.inner.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let channel = self.inner.channel(topic).await;
        Ok(Arc::new(MemorySubscription {
            topic: topic.to_string(),
            channel,
            inner: self.inner.clone(),
        }))
    }
}

struct MemorySubscription {
    topic: String,
    channel: TopicChannel,
    inner: Arc<TransportInner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&self) -> Option<Delivery> {
        let message = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return None,
            message = self.channel.rx.recv() => message?,
        };
        self.channel.queued.fetch_sub(1, Ordering::SeqCst);

        let deliveries = message.deliveries + 1;
        let receipt = Receipt(self.inner.next_receipt.fetch_add(1, Ordering::SeqCst));
        self.inner.inflight.lock().await.insert(
            receipt.0,
            InflightEntry {
                topic: self.topic.clone(),
                payload: message.payload.clone(),
                deliveries,
                deadline: Instant::now() + self.inner.config.visibility_timeout,
            },
        );

        Some(Delivery {
            payload: message.payload,
            attempt: deliveries,
            receipt,
        })
    }

    async fn ack(&self, receipt: Receipt) -> Result<(), QueueError> {
        self.inner
            .inflight
            .lock()
            .await
            .remove(&receipt.0)
            .map(|_| ())
            .ok_or(QueueError::UnknownReceipt(receipt.0))
    }

    async fn nack(&self, receipt: Receipt) -> Result<(), QueueError> {
        let entry = {
            self.inner
                .inflight
                .lock()
                .await
                .remove(&receipt.0)
                .ok_or(QueueError::UnknownReceipt(receipt.0))?
        };
        tracing::debug!(topic = %entry.topic, "Rejected delivery routed to dead-letter");
        self.inner
            .enqueue(
                &dead_letter_topic(&entry.topic),
                QueuedMessage {
                    payload: entry.payload,
                    deliveries: 0,
                },
            )
            .await
    }
}

async fn run_sweeper(inner: Arc<TransportInner>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        sweep(&inner).await;
    }
}

/// Move expired in-flight deliveries back into their queue (or to the
/// dead-letter topic once the ceiling is hit), and requeue delayed messages
/// whose backoff has elapsed.
async fn sweep(inner: &Arc<TransportInner>) {
    let now = Instant::now();

    let expired: Vec<InflightEntry> = {
        let mut inflight = inner.inflight.lock().await;
        let ids: Vec<u64> = inflight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| inflight.remove(&id)).collect()
    };

    for entry in expired {
        if entry.deliveries >= inner.config.max_delivery_attempts {
            tracing::warn!(
                topic = %entry.topic,
                deliveries = entry.deliveries,
                "Delivery budget exhausted; dead-lettering"
            );
            let _ = inner
                .enqueue(
                    &dead_letter_topic(&entry.topic),
                    QueuedMessage {
                        payload: entry.payload,
                        deliveries: 0,
                    },
                )
                .await;
        } else {
            let delay = inner.config.redelivery_backoff.delay_for(entry.deliveries);
            inner.delayed.lock().await.push(DelayedEntry {
                topic: entry.topic,
                payload: entry.payload,
                deliveries: entry.deliveries,
                ready_at: now + delay,
            });
        }
    }

    let ready: Vec<DelayedEntry> = {
        let mut delayed = inner.delayed.lock().await;
        let (ready, keep): (Vec<DelayedEntry>, Vec<DelayedEntry>) =
            delayed.drain(..).partition(|entry| entry.ready_at <= now);
        *delayed = keep;
        ready
    };

    for entry in ready {
        let _ = inner
            .enqueue(
                &entry.topic,
                QueuedMessage {
                    payload: entry.payload,
                    deliveries: entry.deliveries,
                },
            )
            .await;
    }
}
