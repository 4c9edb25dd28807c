//! Queue transport contract.
//!
//! At-least-once topics with explicit acknowledgement: a delivery that is not
//! acked within the visibility window is redelivered (after the configured
//! backoff) until the delivery ceiling, then routed to the paired dead-letter
//! topic. `nack` declares a delivery unprocessable and routes it to the
//! dead-letter topic at once, with no further redelivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryTransport;

/// Topic carrying stage completions back to the orchestrator.
pub const COMPLETIONS_TOPIC: &str = "completions";

/// Dead-letter destination paired with a topic.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Transport shut down; no further publishes or deliveries.
    #[error("transport closed")]
    Closed,
    /// Receipt does not match an in-flight delivery (already acked, nacked,
    /// or reaped by the visibility sweep).
    #[error("unknown receipt: {0}")]
    UnknownReceipt(u64),
}

/// Redelivery delay schedule: exponential doubling from `base`, capped at
/// `max`, with ±10% jitter. `base` must not exceed `max`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Zero delay everywhere; redeliveries requeue immediately.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before the next redelivery, given how many deliveries have
    /// already been made.
    pub fn delay_for(&self, deliveries: u32) -> Duration {
        if self.max.is_zero() {
            return Duration::ZERO;
        }
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;

        let exponent = deliveries.saturating_sub(1).min(20);
        let raw = base_ms.saturating_mul(1u64 << exponent);
        let capped = raw.min(max_ms);
        let jittered = (capped as f64 * rand::rng().random_range(0.9..=1.1)) as u64;
        Duration::from_millis(jittered.clamp(base_ms, max_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Behavior knobs shared by every subscription on a transport.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deliveries allowed per message before it is dead-lettered.
    pub max_delivery_attempts: u32,
    /// How long a delivery may stay unacknowledged before redelivery.
    pub visibility_timeout: Duration,
    pub redelivery_backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            visibility_timeout: Duration::from_secs(30),
            redelivery_backoff: BackoffPolicy::default(),
        }
    }
}

/// Token identifying an in-flight delivery for ack/nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(pub u64);

/// One delivered message.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Bytes,
    /// 1-based count of deliveries of this message, this one included.
    pub attempt: u32,
    pub receipt: Receipt,
}

/// Producer side of the transport.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), QueueError>;

    /// Open a subscription on `topic`. Subscriptions on the same topic
    /// compete for deliveries.
    async fn subscribe(&self, topic: &str) -> Result<Arc<dyn Subscription>, QueueError>;
}

/// Consumer side of one topic.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Next delivery; `None` once the transport shuts down.
    async fn next(&self) -> Option<Delivery>;

    /// Mark the delivery handled; the message is never delivered again.
    async fn ack(&self, receipt: Receipt) -> Result<(), QueueError>;

    /// Declare the delivery unprocessable; the transport routes the message
    /// to the paired dead-letter topic.
    async fn nack(&self, receipt: Receipt) -> Result<(), QueueError>;
}
