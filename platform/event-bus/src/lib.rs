//! # EventBus Abstraction
//!
//! Broker plumbing shared by event-routing services.
//!
//! The connector never talks to a broker client directly. It consumes and
//! publishes through the [`EventBus`] trait so that the same pipeline runs on
//! NATS JetStream in production and on in-process channels in tests.
//!
//! ## Implementations
//!
//! - **NatsBus**: JetStream-backed, at-least-once consumption with explicit acks
//! - **InMemoryBus**: broadcast channels, records settlements for assertions
//!
//! ## Delivery contract
//!
//! Records obtained from [`EventBus::consume`] must be settled with
//! [`EventBus::settle`]. An [`AckKind::Ack`] commits the record; a
//! [`AckKind::Nak`] asks the broker to redeliver it; an [`AckKind::Term`]
//! tells the broker to stop redelivering.
//!
//! ```rust,no_run
//! use event_bus::{AckKind, EventBus, InMemoryBus};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryBus::new();
//! let mut records = bus.consume("orders.in", "connector").await?;
//!
//! bus.publish("orders.in", b"{}".to_vec()).await?;
//!
//! if let Some(record) = records.next().await {
//!     bus.settle(&record, AckKind::Ack).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;
mod route;

pub use envelope::{validate_envelope_fields, EventEnvelope, SPEC_VERSION};
pub use inmemory_bus::{InMemoryBus, Settlement};
pub use nats_bus::NatsBus;
pub use route::{RouteLedger, RouteStep, TOPIC_STEP};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// A record received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The topic this record was published to
    pub subject: String,
    /// Raw record bytes
    pub payload: Vec<u8>,
    /// Optional broker headers
    pub headers: Option<HashMap<String, String>>,
    /// Reply subject; for JetStream deliveries this is the ack subject
    pub reply_to: Option<String>,
    /// Ordering partition. Records sharing a partition must be handled in order.
    pub partition: u32,
    /// Position of the record within its partition
    pub offset: u64,
    /// 1 on first delivery, incremented on every broker redelivery
    pub delivery_attempt: u32,
}

impl BusMessage {
    /// Create a first-delivery record on partition 0
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
            partition: 0,
            offset: 0,
            delivery_attempt: 1,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Place the record at a position in the broker log
    pub fn with_position(mut self, partition: u32, offset: u64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    pub fn with_delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt.max(1);
        self
    }
}

/// How a consumed record is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processing finished; commit the record
    Ack,
    /// Processing failed; redeliver the record
    Nak,
    /// Processing failed permanently; do not redeliver
    Term,
}

impl AckKind {
    /// JetStream acknowledgement payload
    pub fn as_jetstream_payload(&self) -> &'static str {
        match self {
            AckKind::Ack => "+ACK",
            AckKind::Nak => "-NAK",
            AckKind::Term => "+TERM",
        }
    }
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::Ack => write!(f, "ack"),
            AckKind::Nak => write!(f, "nak"),
            AckKind::Term => write!(f, "term"),
        }
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("failed to settle message: {0}")]
    AckError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction for publish/consume messaging
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a record to a topic.
    ///
    /// Returns only once the broker accepted the record.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to records matching a subject pattern (supports `*` and `>`).
    ///
    /// Subscriptions are fire-and-forget: records are never redelivered.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Consume a topic as member of a durable consumer group.
    ///
    /// Every yielded record must later be passed to [`EventBus::settle`].
    async fn consume(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        tracing::debug!(subject = %subject, group = %group, "Bus has no durable consumers, subscribing");
        self.subscribe(subject).await
    }

    /// Settle a record obtained from [`EventBus::consume`]
    async fn settle(&self, message: &BusMessage, kind: AckKind) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_message_defaults_to_first_delivery() {
        let msg = BusMessage::new("in".to_string(), vec![1, 2, 3]);
        assert_eq!(msg.partition, 0);
        assert_eq!(msg.offset, 0);
        assert_eq!(msg.delivery_attempt, 1);
    }

    #[test]
    fn test_delivery_attempt_never_zero() {
        let msg = BusMessage::new("in".to_string(), vec![]).with_delivery_attempt(0);
        assert_eq!(msg.delivery_attempt, 1);
    }

    #[test]
    fn test_jetstream_ack_payloads() {
        assert_eq!(AckKind::Ack.as_jetstream_payload(), "+ACK");
        assert_eq!(AckKind::Nak.as_jetstream_payload(), "-NAK");
        assert_eq!(AckKind::Term.as_jetstream_payload(), "+TERM");
    }
}
