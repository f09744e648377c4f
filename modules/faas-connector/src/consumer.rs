use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::{AckKind, BusMessage, BusResult, EventBus};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::dispatcher::{Dispatcher, ProcessingError};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub topic: String,
    pub group: String,
    /// Lifecycles running at the same time, across all partitions; also the
    /// number of records a partition lane buffers before the loop waits
    pub max_in_flight: usize,
    pub retry: RetryConfig,
}

struct Worker {
    bus: Arc<dyn EventBus>,
    dispatcher: Dispatcher,
    retry: RetryConfig,
    limiter: Arc<Semaphore>,
}

/// Start the connector's consumption loop
///
/// The topic is bound before this function returns, so records published
/// afterwards are not missed. The returned task:
/// 1. Routes every record to the lane of its partition
/// 2. Runs lifecycles of one partition strictly in order
/// 3. Settles each record only after its lifecycle finished
///
/// The task ends when the record stream ends and all lanes drained.
pub async fn start_connector_consumer(
    bus: Arc<dyn EventBus>,
    dispatcher: Dispatcher,
    settings: ConsumerSettings,
) -> BusResult<JoinHandle<()>> {
    let mut stream = bus.consume(&settings.topic, &settings.group).await?;

    tracing::info!(
        topic = %settings.topic,
        group = %settings.group,
        max_in_flight = settings.max_in_flight,
        max_attempts = settings.retry.max_attempts,
        "Connector consumer subscribed"
    );

    let worker = Arc::new(Worker {
        bus,
        dispatcher,
        retry: settings.retry,
        limiter: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
    });

    let lane_buffer = settings.max_in_flight.max(1);
    let topic = settings.topic;

    let handle = tokio::spawn(async move {
        let mut lanes: HashMap<u32, (mpsc::Sender<BusMessage>, JoinHandle<()>)> = HashMap::new();

        while let Some(msg) = stream.next().await {
            let partition = msg.partition;
            let (sender, _) = lanes
                .entry(partition)
                .or_insert_with(|| spawn_lane(partition, lane_buffer, worker.clone()));

            if let Err(e) = sender.send(msg).await {
                tracing::error!(
                    partition,
                    offset = e.0.offset,
                    "Partition lane stopped, record left unsettled"
                );
            }
        }

        tracing::warn!(topic = %topic, "Connector consumer stream ended, draining lanes");

        for (_, (sender, lane)) in lanes.drain() {
            drop(sender);
            if let Err(e) = lane.await {
                tracing::error!(error = %e, "Partition lane panicked");
            }
        }

        tracing::warn!(topic = %topic, "Connector consumer stopped");
    });

    Ok(handle)
}

fn spawn_lane(
    partition: u32,
    buffer: usize,
    worker: Arc<Worker>,
) -> (mpsc::Sender<BusMessage>, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<BusMessage>(buffer);

    let lane = tokio::spawn(async move {
        tracing::debug!(partition, "Partition lane started");
        while let Some(msg) = receiver.recv().await {
            process_record(&worker, msg).await;
        }
    });

    (sender, lane)
}

async fn process_record(worker: &Worker, msg: BusMessage) {
    let _permit = match worker.limiter.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            tracing::error!(offset = msg.offset, "Concurrency limiter closed");
            return;
        }
    };

    let span = tracing::info_span!(
        "process_event",
        topic = %msg.subject,
        partition = msg.partition,
        offset = msg.offset,
        delivery_attempt = msg.delivery_attempt,
        event_id = tracing::field::Empty,
        correlation_id = tracing::field::Empty,
    );

    async {
        let dispatcher = &worker.dispatcher;
        let record = &msg;

        let outcome = retry_with_backoff(
            move |_attempt| dispatcher.handle(record),
            |_| true,
            &worker.retry,
            "faas_connector_consumer",
        )
        .await;

        let metrics = dispatcher.metrics();
        let kind = match &outcome.result {
            Ok(disposition) => {
                metrics.record_outcome(disposition.outcome());
                AckKind::Ack
            }
            Err(e @ ProcessingError::Poison(_)) => {
                metrics.record_outcome(e.outcome());
                tracing::error!(
                    partition = msg.partition,
                    offset = msg.offset,
                    attempts = outcome.attempts,
                    error = %e,
                    "Poison record exhausted redeliveries, terminating"
                );
                AckKind::Term
            }
            Err(e @ ProcessingError::Publish { .. }) => {
                metrics.record_outcome(e.outcome());
                tracing::error!(
                    partition = msg.partition,
                    offset = msg.offset,
                    correlation_id = %e.correlation_id().unwrap_or("none"),
                    attempts = outcome.attempts,
                    error = %e,
                    "Publish failed after retries, record not acknowledged"
                );
                AckKind::Nak
            }
        };

        if let Err(e) = worker.bus.settle(&msg, kind).await {
            tracing::error!(kind = %kind, error = %e, "Failed to settle record");
        }
    }
    .instrument(span)
    .await;
}
