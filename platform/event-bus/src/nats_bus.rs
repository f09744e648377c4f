//! NATS JetStream implementation of the EventBus trait

use crate::{AckKind, BusError, BusMessage, BusResult, EventBus};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy},
};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;

/// Default number of deliveries JetStream attempts per record (1 redelivery)
const DEFAULT_MAX_DELIVER: i64 = 2;

/// JetStream's own defaults for unsettled records
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ACK_PENDING: i64 = 1000;

/// EventBus implementation using NATS JetStream
///
/// Publishes go through JetStream and wait for the stream's publish ack.
/// `consume` binds a durable pull consumer with explicit acks to the stream
/// that owns the topic; the stream itself must already exist.
///
/// A record left unsettled for longer than `ack_wait` is redelivered, so
/// `ack_wait` must cover the slowest lifecycle of every record the consumer
/// may hold (`max_ack_pending`).
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client)
///     .with_max_deliver(3)
///     .with_ack_wait(std::time::Duration::from_secs(300))
///     .with_max_ack_pending(16);
///
/// bus.publish("functions.resize.out", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    bounds: ConsumerBounds,
}

/// Settlement limits applied to durable consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConsumerBounds {
    max_deliver: i64,
    ack_wait: Duration,
    max_ack_pending: i64,
}

impl Default for ConsumerBounds {
    fn default() -> Self {
        Self {
            max_deliver: DEFAULT_MAX_DELIVER,
            ack_wait: DEFAULT_ACK_WAIT,
            max_ack_pending: DEFAULT_MAX_ACK_PENDING,
        }
    }
}

impl ConsumerBounds {
    fn pull_config(&self, subject: &str, group: &str) -> pull::Config {
        pull::Config {
            durable_name: Some(group.to_string()),
            filter_subject: subject.to_string(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.ack_wait,
            max_ack_pending: self.max_ack_pending,
            max_deliver: self.max_deliver,
            ..Default::default()
        }
    }
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            bounds: ConsumerBounds::default(),
        }
    }

    /// Bound the number of deliveries per record for durable consumers
    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.bounds.max_deliver = i64::from(max_deliver.max(1));
        self
    }

    /// How long a delivered record may stay unsettled before redelivery
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.bounds.ack_wait = ack_wait;
        self
    }

    /// Bound the records delivered but not yet settled
    pub fn with_max_ack_pending(mut self, max_ack_pending: usize) -> Self {
        self.bounds.max_ack_pending = i64::try_from(max_ack_pending.max(1)).unwrap_or(i64::MAX);
        self
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn header_map(headers: &async_nats::HeaderMap) -> Option<HashMap<String, String>> {
        let mut map = HashMap::new();
        for (key, values) in headers.iter() {
            if let Some(value) = values.first() {
                map.insert(key.to_string(), value.to_string());
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(map)
        }
    }

    fn from_jetstream(message: jetstream::Message) -> BusMessage {
        // JetStream streams are a single ordered log: everything is partition 0
        let (offset, attempt) = match message.info() {
            Ok(info) => (info.stream_sequence, u32::try_from(info.delivered).unwrap_or(1)),
            Err(e) => {
                tracing::warn!(error = %e, "JetStream record without delivery info");
                (0, 1)
            }
        };

        let inner = message.message;
        let mut msg = BusMessage::new(inner.subject.to_string(), inner.payload.to_vec())
            .with_position(0, offset)
            .with_delivery_attempt(attempt);

        if let Some(reply) = inner.reply {
            msg = msg.with_reply_to(reply.to_string());
        }
        if let Some(headers) = inner.headers.as_ref().and_then(Self::header_map) {
            msg = msg.with_headers(headers);
        }

        msg
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        ack.await
            .map_err(|e| BusError::PublishError(format!("{} (not acknowledged)", e)))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| {
            let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            if let Some(reply) = nats_msg.reply {
                msg = msg.with_reply_to(reply.to_string());
            }
            if let Some(headers) = nats_msg.headers.as_ref().and_then(Self::header_map) {
                msg = msg.with_headers(headers);
            }

            msg
        });

        Ok(stream.boxed())
    }

    async fn consume(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let stream_name = self
            .jetstream
            .stream_by_subject(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(format!("no stream for {}: {}", subject, e)))?;

        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(group, self.bounds.pull_config(subject, group))
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        tracing::info!(
            subject = %subject,
            stream = %stream_name,
            group = %group,
            max_deliver = self.bounds.max_deliver,
            ack_wait_secs = self.bounds.ack_wait.as_secs(),
            max_ack_pending = self.bounds.max_ack_pending,
            "Bound durable JetStream consumer"
        );

        let records = messages.filter_map(|delivery| {
            futures::future::ready(match delivery {
                Ok(message) => Some(Self::from_jetstream(message)),
                Err(e) => {
                    tracing::warn!(error = %e, "JetStream delivery error");
                    None
                }
            })
        });

        Ok(records.boxed())
    }

    async fn settle(&self, message: &BusMessage, kind: AckKind) -> BusResult<()> {
        let reply = message.reply_to.as_ref().ok_or_else(|| {
            BusError::AckError(format!(
                "record {}@{} has no ack subject",
                message.subject, message.offset
            ))
        })?;

        self.client
            .publish(reply.clone(), kind.as_jetstream_payload().into())
            .await
            .map_err(|e| BusError::AckError(e.to_string()))?;

        Ok(())
    }
}
