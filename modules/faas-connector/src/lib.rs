pub mod config;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod enricher;
pub mod ingress;
pub mod invocation;
pub mod metrics;
pub mod publisher;
pub mod routes;

pub use config::{BusType, Config, InvocationConfig, TopicConfig};
pub use consumer::{start_connector_consumer, ConsumerSettings};
pub use dispatcher::{Disposition, Dispatcher, ProcessingError, Rejection};
pub use invocation::{FunctionInvoker, HttpInvoker, InvocationError, PassthroughInvoker};
pub use metrics::Metrics;
pub use publisher::{Delivery, DeliveryKind, Publisher};
