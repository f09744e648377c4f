use event_bus::{EventBus, InMemoryBus, NatsBus};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use faas_connector::{
    config::{BusType, Config},
    routes::router,
    start_connector_consumer, ConsumerSettings, Dispatcher, FunctionInvoker, HttpInvoker,
    Metrics, PassthroughInvoker, Publisher,
};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting FaaS connector...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        input = %config.topics.input,
        outputs = ?config.topics.outputs,
        invalid = %config.topics.invalid_message,
        test = %config.topics.test_message_output,
        "Configuration loaded"
    );

    // Create event bus
    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        BusType::Nats => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let client = async_nats::connect(&config.nats_url)
                .await
                .expect("Failed to connect to NATS");
            let ack_wait = config.ack_wait();
            tracing::info!(
                ack_wait_secs = ack_wait.as_secs(),
                max_ack_pending = config.max_in_flight,
                "JetStream settlement bounds"
            );
            Arc::new(
                NatsBus::new(client)
                    .with_max_deliver(config.max_redeliveries.saturating_add(1))
                    .with_ack_wait(ack_wait)
                    .with_max_ack_pending(config.max_in_flight),
            )
        }
    };

    let invoker: Arc<dyn FunctionInvoker> = match &config.invocation.function_name {
        Some(name) if !config.invocation.skip_function_call => {
            let invoker = HttpInvoker::new(
                &config.invocation.gateway,
                name,
                config.invocation.timeout,
            )
            .expect("Failed to build function client");
            tracing::info!(url = %invoker.url(), "Invoking function over HTTP");
            Arc::new(invoker)
        }
        _ => {
            tracing::info!("Function calls skipped, payloads pass through");
            Arc::new(PassthroughInvoker)
        }
    };

    let metrics = Metrics::new().expect("Failed to register metrics");
    let publisher = Publisher::new(bus.clone(), metrics.clone());
    let dispatcher = Dispatcher::new(invoker, publisher, config.topics.clone(), metrics.clone());

    let consumer = start_connector_consumer(
        bus.clone(),
        dispatcher,
        ConsumerSettings {
            topic: config.topics.input.clone(),
            group: config.consumer_group.clone(),
            max_in_flight: config.max_in_flight,
            retry: config.retry(),
        },
    )
    .await
    .expect("Failed to start connector consumer");

    let app = router(metrics);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST:PORT");
    tracing::info!("FaaS connector listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result.expect("Server failed to start");
        }
        result = consumer => {
            match result {
                Ok(()) => tracing::error!("Connector consumer exited, shutting down"),
                Err(e) => tracing::error!(error = %e, "Connector consumer panicked"),
            }
            std::process::exit(1);
        }
    }
}
