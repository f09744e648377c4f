//! In-memory implementation of the EventBus trait for testing and development

use crate::{AckKind, BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// A settlement recorded by [`InMemoryBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub subject: String,
    pub partition: u32,
    pub offset: u64,
    pub kind: AckKind,
}

/// Broadcast-channel bus for tests and local runs
///
/// Every published record gets the next offset of the bus, so offsets reflect
/// publish order. Consumer groups are not modelled: `consume` is a plain
/// subscription and settlements are only recorded, never acted on.
///
/// ```rust
/// use event_bus::{AckKind, EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut records = bus.consume("fn.resize.in", "connector").await?;
///
/// bus.publish_to_partition("fn.resize.in", 2, b"{}".to_vec());
///
/// let record = records.next().await.ok_or("stream ended")?;
/// assert_eq!((record.partition, record.offset), (2, 0));
///
/// bus.settle(&record, AckKind::Ack).await?;
/// assert_eq!(bus.settlements()[0].kind, AckKind::Ack);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<BusMessage>>,
    next_offset: Arc<AtomicU64>,
    settlements: Arc<Mutex<Vec<Settlement>>>,
}

impl InMemoryBus {
    /// Bus buffering up to 1000 records per subscriber; slower subscribers
    /// lose the oldest records
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            next_offset: Arc::new(AtomicU64::new(0)),
            settlements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Publish a record on an explicit ordering partition
    pub fn publish_to_partition(&self, subject: &str, partition: u32, payload: Vec<u8>) {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let msg =
            BusMessage::new(subject.to_string(), payload).with_position(partition, offset);

        // No receivers is fine
        let _ = self.sender.send(msg);
    }

    /// Settlements recorded so far, in settlement order
    pub fn settlements(&self) -> Vec<Settlement> {
        match self.settlements.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// NATS-style subject matching: `*` is one token, `>` one or more
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let mut tokens = subject.split('.');
        for expected in pattern.split('.') {
            match expected {
                ">" => return tokens.next().is_some(),
                "*" => {
                    if tokens.next().is_none() {
                        return false;
                    }
                }
                literal => {
                    if tokens.next() != Some(literal) {
                        return false;
                    }
                }
            }
        }
        tokens.next().is_none()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.publish_to_partition(subject, 0, payload);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(pattern = %pattern, skipped, "InMemoryBus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn settle(&self, message: &BusMessage, kind: AckKind) -> BusResult<()> {
        let settlement = Settlement {
            subject: message.subject.clone(),
            partition: message.partition,
            offset: message.offset,
            kind,
        };
        match self.settlements.lock() {
            Ok(mut guard) => guard.push(settlement),
            Err(poisoned) => poisoned.into_inner().push(settlement),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(stream: &mut BoxStream<'static, BusMessage>) -> BusMessage {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
    }

    #[test]
    fn test_pattern_matching() {
        assert!(InMemoryBus::matches_pattern("orders.in", "orders.in"));

        assert!(InMemoryBus::matches_pattern("fn.orders.out", "fn.*.out"));
        assert!(!InMemoryBus::matches_pattern("fn.orders.v1.out", "fn.*.out"));

        assert!(InMemoryBus::matches_pattern("fn.orders.out", "fn.>"));
        assert!(!InMemoryBus::matches_pattern("fn.orders.out", "billing.>"));

        assert!(InMemoryBus::matches_pattern("single", "*"));
        assert!(InMemoryBus::matches_pattern("single", ">"));
        assert!(!InMemoryBus::matches_pattern("one.two", "one"));
    }

    #[tokio::test]
    async fn test_offsets_follow_publish_order() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("orders.>").await.unwrap();

        for i in 0..3 {
            bus.publish(&format!("orders.msg.{}", i), vec![i as u8])
                .await
                .unwrap();
        }

        for i in 0..3u64 {
            let msg = next(&mut stream).await;
            assert_eq!(msg.offset, i);
            assert_eq!(msg.partition, 0);
            assert_eq!(msg.delivery_attempt, 1);
        }
    }

    #[tokio::test]
    async fn test_publish_to_partition() {
        let bus = InMemoryBus::new();
        let mut stream = bus.consume("orders.in", "group").await.unwrap();

        bus.publish_to_partition("orders.in", 3, b"a".to_vec());
        bus.publish_to_partition("orders.in", 1, b"b".to_vec());

        let first = next(&mut stream).await;
        let second = next(&mut stream).await;
        assert_eq!((first.partition, first.offset), (3, 0));
        assert_eq!((second.partition, second.offset), (1, 1));
    }

    #[tokio::test]
    async fn test_wildcard_filtering() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("fn.events.*").await.unwrap();

        bus.publish("fn.events.created", b"match".to_vec())
            .await
            .unwrap();
        bus.publish("fn.events.user.created", b"no match".to_vec())
            .await
            .unwrap();
        bus.publish("other.events.created", b"no match".to_vec())
            .await
            .unwrap();

        let msg = next(&mut stream).await;
        assert_eq!(msg.subject, "fn.events.created");

        let result = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(result.is_err(), "should timeout, no more messages");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = InMemoryBus::new();
        let mut stream1 = bus.subscribe("test.>").await.unwrap();
        let mut stream2 = bus.subscribe("test.>").await.unwrap();

        bus.publish("test.msg", b"broadcast".to_vec()).await.unwrap();

        assert_eq!(next(&mut stream1).await.payload, b"broadcast");
        assert_eq!(next(&mut stream2).await.payload, b"broadcast");
    }

    #[tokio::test]
    async fn test_settlements_are_recorded() {
        let bus = InMemoryBus::new();
        let msg = BusMessage::new("orders.in".to_string(), vec![]).with_position(2, 7);

        bus.settle(&msg, AckKind::Ack).await.unwrap();
        bus.settle(&msg, AckKind::Nak).await.unwrap();

        let settlements = bus.settlements();
        assert_eq!(settlements.len(), 2);
        assert_eq!(
            settlements[0],
            Settlement {
                subject: "orders.in".to_string(),
                partition: 2,
                offset: 7,
                kind: AckKind::Ack,
            }
        );
        assert_eq!(settlements[1].kind, AckKind::Nak);
    }
}
