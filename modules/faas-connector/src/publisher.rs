//! Fan-out of processed envelopes to their destination topics.
//!
//! Every destination gets its own clone of the envelope, and with it its own
//! route ledger. Sends happen one after another in destination order and each
//! one completes only once the broker accepted it.

use event_bus::{BusError, EventBus, EventEnvelope};
use std::sync::Arc;

use crate::config::ordered_set;
use crate::enricher::{append_route, enrich, EnrichContext, Enriched};
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Sent to the requested destination
    Destination,
    /// Test traffic diverted to the test-observation topic
    TestDiversion,
    /// Error envelope sent to the invalid-message topic
    Invalid,
}

impl DeliveryKind {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryKind::Destination => "destination",
            DeliveryKind::TestDiversion => "test",
            DeliveryKind::Invalid => "invalid",
        }
    }
}

/// One envelope accepted by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Requested destination
    pub destination: String,
    /// Topic actually written to
    pub topic: String,
    pub kind: DeliveryKind,
}

#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn EventBus>,
    metrics: Metrics,
}

impl Publisher {
    pub fn new(bus: Arc<dyn EventBus>, metrics: Metrics) -> Self {
        Self { bus, metrics }
    }

    /// Send one enriched copy of `envelope` per destination
    ///
    /// Duplicate destinations are sent to once. The first failed send aborts
    /// the fan-out; copies already accepted stay published.
    pub async fn publish(
        &self,
        envelope: &EventEnvelope,
        destinations: &[String],
        ctx: &EnrichContext<'_>,
    ) -> Result<Vec<Delivery>, BusError> {
        let mut deliveries = Vec::with_capacity(destinations.len());

        for destination in ordered_set(destinations) {
            let mut copy = envelope.clone();

            let (topic, kind) = match enrich(&mut copy, ctx, &destination) {
                Enriched::Deliver { topic } => (topic, DeliveryKind::Destination),
                Enriched::TestFiltered { topic } => {
                    tracing::info!(
                        event_id = %copy.id,
                        destination = %destination,
                        test_topic = %topic,
                        "Diverting test message"
                    );
                    (topic, DeliveryKind::TestDiversion)
                }
                Enriched::Expired => {
                    tracing::warn!(
                        event_id = %copy.id,
                        destination = %destination,
                        "Envelope expired during fan-out, not sent"
                    );
                    continue;
                }
            };

            self.send(&copy, &topic, kind).await?;
            deliveries.push(Delivery {
                destination,
                topic,
                kind,
            });
        }

        Ok(deliveries)
    }

    /// Send an error envelope to the invalid-message topic
    ///
    /// No test filtering applies.
    pub async fn publish_invalid(
        &self,
        mut envelope: EventEnvelope,
        invalid_topic: &str,
    ) -> Result<Delivery, BusError> {
        append_route(&mut envelope, invalid_topic);
        self.send(&envelope, invalid_topic, DeliveryKind::Invalid)
            .await?;

        Ok(Delivery {
            destination: invalid_topic.to_string(),
            topic: invalid_topic.to_string(),
            kind: DeliveryKind::Invalid,
        })
    }

    async fn send(
        &self,
        envelope: &EventEnvelope,
        topic: &str,
        kind: DeliveryKind,
    ) -> Result<(), BusError> {
        let payload = envelope
            .encode()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        self.bus.publish(topic, payload).await?;
        self.metrics.record_send(kind.label());

        tracing::debug!(
            event_id = %envelope.id,
            topic = %topic,
            kind = kind.label(),
            "Envelope published"
        );
        Ok(())
    }
}
