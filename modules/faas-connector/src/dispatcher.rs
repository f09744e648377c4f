//! Lifecycle of one consumed record.
//!
//! ```text
//! RECEIVED -> expired ---------------------------> error envelope -> invalid topic
//!          -> invoke -> ok -----------------------> fan-out to destinations
//!                    -> failed -------------------> error envelope -> invalid topic
//! ```
//!
//! Poison records and failed sends are returned as [`ProcessingError`]; the
//! consumer decides about redelivery and settlement.

use chrono::{DateTime, Utc};
use event_bus::{BusError, BusMessage, EventEnvelope};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{ordered_set, TopicConfig};
use crate::context::{record_id, Clock, IdGenerator, SystemClock, UuidGenerator};
use crate::enricher::{record_arrival, validate, EnrichContext, Validation};
use crate::ingress::{self, Ingress, PoisonSignal};
use crate::invocation::{FunctionInvoker, InvocationError};
use crate::metrics::Metrics;
use crate::publisher::{Delivery, Publisher};

/// Why a record was answered with an error envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Expired { expiry: DateTime<Utc> },
    InvocationFailed(InvocationError),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Expired { expiry } => write!(f, "event expired at {}", expiry.to_rfc3339()),
            Rejection::InvocationFailed(e) => write!(f, "{}", e),
        }
    }
}

/// How a record's lifecycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Forwarded(Vec<Delivery>),
    Rejected {
        rejection: Rejection,
        error_envelope_id: String,
        delivery: Delivery,
    },
}

impl Disposition {
    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            Disposition::Forwarded(_) => "forwarded",
            Disposition::Rejected {
                rejection: Rejection::Expired { .. },
                ..
            } => "expired",
            Disposition::Rejected {
                rejection: Rejection::InvocationFailed(_),
                ..
            } => "invocation_failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("{0}")]
    Poison(PoisonSignal),

    #[error("failed to publish event {event_id}: {source}")]
    Publish {
        event_id: String,
        correlation_id: Option<String>,
        #[source]
        source: BusError,
    },
}

impl ProcessingError {
    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            ProcessingError::Poison(_) => "poison",
            ProcessingError::Publish { .. } => "publish_failed",
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ProcessingError::Poison(_) => None,
            ProcessingError::Publish { correlation_id, .. } => correlation_id.as_deref(),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<dyn FunctionInvoker>,
    publisher: Publisher,
    topics: TopicConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        invoker: Arc<dyn FunctionInvoker>,
        publisher: Publisher,
        topics: TopicConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            invoker,
            publisher,
            topics,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            metrics,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run the full lifecycle for one record
    ///
    /// Returns once every resulting envelope was accepted by the broker.
    pub async fn handle(&self, message: &BusMessage) -> Result<Disposition, ProcessingError> {
        let mut envelope = match ingress::decode(message) {
            Ingress::Envelope(envelope) => envelope,
            Ingress::Poison(signal) => {
                tracing::warn!(error = %signal.error, "Record could not be decoded");
                return Err(ProcessingError::Poison(signal));
            }
        };

        let ctx = EnrichContext {
            now: self.clock.now(),
            ids: self.ids.as_ref(),
            test_topic: &self.topics.test_message_output,
        };

        // retries re-decode the record; the default id must not change between them
        if envelope.id.trim().is_empty() {
            envelope.id = record_id(&message.subject, message.partition, message.offset);
        }

        record_arrival(&mut envelope, &message.subject);
        let validation = validate(&mut envelope, &ctx);

        let span = tracing::Span::current();
        span.record("event_id", envelope.id.as_str());
        span.record(
            "correlation_id",
            envelope.correlation_id.as_deref().unwrap_or_default(),
        );

        if validation == Validation::Expired {
            let expiry = envelope.expiry.unwrap_or(ctx.now);
            tracing::info!(expiry = %expiry, "Event expired, rejecting");
            return self
                .reject(&envelope, Rejection::Expired { expiry }, &ctx)
                .await;
        }

        let started = Instant::now();
        let result = self.invoker.invoke(&envelope).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(data) => {
                self.metrics.observe_invocation("ok", elapsed);

                let mut outgoing = envelope.map_data(|_| data);
                let destinations = self.destinations_for(&mut outgoing);

                let deliveries = self
                    .publisher
                    .publish(&outgoing, &destinations, &ctx)
                    .await
                    .map_err(|source| publish_error(&outgoing, source))?;

                tracing::info!(sends = deliveries.len(), "Event forwarded");
                Ok(Disposition::Forwarded(deliveries))
            }
            Err(e) => {
                self.metrics.observe_invocation("error", elapsed);
                tracing::warn!(error = %e, "Function invocation failed");
                self.reject(&envelope, Rejection::InvocationFailed(e), &ctx)
                    .await
            }
        }
    }

    /// Destination set for an invoked envelope
    ///
    /// Pops the top of the routing slip; falls back to the configured output
    /// topics when the slip is empty or its top entry names no topic.
    pub fn destinations_for(&self, envelope: &mut EventEnvelope) -> Vec<String> {
        match envelope.routing_slip.pop().map(ordered_set) {
            Some(next) if !next.is_empty() => next,
            _ => self.topics.outputs.clone(),
        }
    }

    async fn reject(
        &self,
        envelope: &EventEnvelope,
        rejection: Rejection,
        ctx: &EnrichContext<'_>,
    ) -> Result<Disposition, ProcessingError> {
        let error_envelope = derive_error_envelope(envelope, &rejection.to_string(), ctx);
        let error_envelope_id = error_envelope.id.clone();

        let delivery = self
            .publisher
            .publish_invalid(error_envelope, &self.topics.invalid_message)
            .await
            .map_err(|source| publish_error(envelope, source))?;

        Ok(Disposition::Rejected {
            rejection,
            error_envelope_id,
            delivery,
        })
    }
}

/// Manufacture the error envelope reporting a failure of `original`
///
/// The payload, extensions, route and correlation id of the original are kept
/// for diagnostics.
pub fn derive_error_envelope(
    original: &EventEnvelope,
    cause: &str,
    ctx: &EnrichContext<'_>,
) -> EventEnvelope {
    let mut error = original.clone();
    error.id = ctx.ids.next_id();
    error.time = Some(ctx.now);
    error.created_from = Some(original.id.clone());
    error.is_error_message = true;
    error.error_message = Some(cause.to_string());
    error.expiry = None;
    error.routing_slip.clear();
    error
}

fn publish_error(envelope: &EventEnvelope, source: BusError) -> ProcessingError {
    ProcessingError::Publish {
        event_id: envelope.id.clone(),
        correlation_id: envelope.correlation_id.clone(),
        source,
    }
}
