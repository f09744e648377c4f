//! Common test utilities for connector pipeline tests
//!
//! Every test runs the real consumer against an [`InMemoryBus`], with a fixed
//! clock and sequential ids so enrichment results are predictable.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use event_bus::consumer_retry::RetryConfig;
use event_bus::{
    AckKind, BusError, BusMessage, BusResult, EventBus, EventEnvelope, InMemoryBus, Settlement,
};
use faas_connector::context::{FixedClock, SequentialIds};
use faas_connector::{
    start_connector_consumer, ConsumerSettings, Dispatcher, FunctionInvoker, InvocationError,
    Metrics, Publisher, TopicConfig,
};
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const INPUT: &str = "fn.in";
pub const OUTPUT: &str = "fn.out";
pub const INVALID: &str = "fn.invalid";
pub const TEST_TOPIC: &str = "fn.test";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn topics(outputs: &[&str]) -> TopicConfig {
    TopicConfig {
        input: INPUT.to_string(),
        outputs: outputs.iter().map(|t| t.to_string()).collect(),
        invalid_message: INVALID.to_string(),
        test_message_output: TEST_TOPIC.to_string(),
    }
}

/// Function stand-in: wraps the payload as `{"processed": <data>}`
///
/// A payload carrying `delay_ms` is answered after that many milliseconds.
#[derive(Default)]
pub struct StubInvoker {
    calls: AtomicUsize,
    fail: bool,
}

impl StubInvoker {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FunctionInvoker for StubInvoker {
    async fn invoke(&self, envelope: &EventEnvelope) -> Result<Option<Value>, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fail {
            return Err(InvocationError::Rejected {
                status: 500,
                body: "boom".to_string(),
            });
        }

        let data = envelope.data.clone().unwrap_or(Value::Null);
        if let Some(ms) = data.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(Some(json!({ "processed": data })))
    }
}

/// Bus whose publishes to one topic are always refused
#[derive(Clone)]
pub struct RefusingBus {
    pub inner: InMemoryBus,
    pub refused_topic: String,
}

#[async_trait]
impl EventBus for RefusingBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        if subject == self.refused_topic {
            return Err(BusError::PublishError(format!("{} unavailable", subject)));
        }
        self.inner.publish(subject, payload).await
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        self.inner.subscribe(subject).await
    }

    async fn settle(&self, message: &BusMessage, kind: AckKind) -> BusResult<()> {
        self.inner.settle(message, kind).await
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
    }
}

/// Start the consumer on [`INPUT`]
pub async fn start_connector(
    bus: Arc<dyn EventBus>,
    invoker: Arc<dyn FunctionInvoker>,
    topics: TopicConfig,
) -> JoinHandle<()> {
    let metrics = Metrics::new().unwrap();
    let dispatcher = Dispatcher::new(
        invoker,
        Publisher::new(bus.clone(), metrics.clone()),
        topics.clone(),
        metrics,
    )
    .with_clock(Arc::new(FixedClock(now())))
    .with_ids(Arc::new(SequentialIds::new("gen")));

    start_connector_consumer(
        bus,
        dispatcher,
        ConsumerSettings {
            topic: topics.input,
            group: "connector-test".to_string(),
            max_in_flight: 4,
            retry: fast_retry(),
        },
    )
    .await
    .unwrap()
}

pub fn encode(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

/// Wait until the bus recorded at least `count` settlements
pub async fn wait_for_settlements(bus: &InMemoryBus, count: usize) -> Vec<Settlement> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let settlements = bus.settlements();
            if settlements.len() >= count {
                return settlements;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for settlements")
}

pub async fn next_envelope(stream: &mut BoxStream<'static, BusMessage>) -> EventEnvelope {
    let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timeout waiting for envelope")
        .expect("stream ended");
    EventEnvelope::decode(&msg.payload).unwrap()
}

pub async fn next_raw(stream: &mut BoxStream<'static, BusMessage>) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timeout waiting for record")
        .expect("stream ended");
    serde_json::from_slice(&msg.payload).unwrap()
}

pub async fn assert_silent(stream: &mut BoxStream<'static, BusMessage>) {
    let result = tokio::time::timeout(Duration::from_millis(150), stream.next()).await;
    assert!(result.is_err(), "expected no record, got {:?}", result);
}

pub fn kinds(settlements: &[Settlement]) -> Vec<AckKind> {
    settlements.iter().map(|s| s.kind).collect()
}
