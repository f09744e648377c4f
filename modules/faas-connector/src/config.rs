use event_bus::consumer_retry::RetryConfig;
use std::env;
use std::time::Duration;

/// Time allowed per attempt for publishing the results of one lifecycle
const PUBLISH_ALLOWANCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    fn parse(raw: Option<String>) -> Self {
        match raw
            .unwrap_or_else(|| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                tracing::warn!(bus_type = %other, "Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

/// Topics the connector reads from and writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub input: String,
    /// Ordered, duplicate-free
    pub outputs: Vec<String>,
    pub invalid_message: String,
    pub test_message_output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationConfig {
    pub gateway: String,
    pub function_name: Option<String>,
    pub skip_function_call: bool,
    pub timeout: Duration,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: String,
    pub consumer_group: String,
    pub topics: TopicConfig,
    pub invocation: InvocationConfig,
    pub max_in_flight: usize,
    pub max_redeliveries: u32,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("{} must be set", key))
        };
        let or_default = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let bus_type = BusType::parse(lookup("BUS_TYPE"));
        let nats_url = or_default("NATS_URL", "nats://localhost:4222");
        let consumer_group = or_default("CONSUMER_GROUP", "faas-connector");

        let outputs = ordered_set(required("OUTPUT_TOPICS")?.split(','));
        if outputs.is_empty() {
            return Err("OUTPUT_TOPICS must name at least one topic".to_string());
        }

        let topics = TopicConfig {
            input: required("INPUT_TOPIC")?,
            outputs,
            invalid_message: required("INVALID_MESSAGE_TOPIC")?,
            test_message_output: required("TEST_MESSAGE_OUTPUT_TOPIC")?,
        };
        if topics.outputs.contains(&topics.input) {
            return Err(format!(
                "OUTPUT_TOPICS must not contain INPUT_TOPIC {}",
                topics.input
            ));
        }

        let skip_function_call = or_default("SKIP_FUNCTION_CALL", "false")
            .parse::<bool>()
            .map_err(|_| "SKIP_FUNCTION_CALL must be true or false".to_string())?;

        let function_name = lookup("OPENFAAS_FUNCTION_NAME")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if function_name.is_none() && !skip_function_call {
            return Err(
                "OPENFAAS_FUNCTION_NAME must be set unless SKIP_FUNCTION_CALL=true".to_string(),
            );
        }

        let timeout_ms: u64 = or_default("INVOCATION_TIMEOUT_MS", "30000")
            .parse()
            .map_err(|_| "INVOCATION_TIMEOUT_MS must be a number of milliseconds".to_string())?;
        if timeout_ms == 0 {
            return Err("INVOCATION_TIMEOUT_MS must be greater than zero".to_string());
        }

        let invocation = InvocationConfig {
            gateway: or_default("OPENFAAS_GATEWAY", "http://127.0.0.1:8080"),
            function_name,
            skip_function_call,
            timeout: Duration::from_millis(timeout_ms),
        };

        let max_in_flight: usize = or_default("MAX_IN_FLIGHT", "16")
            .parse()
            .map_err(|_| "MAX_IN_FLIGHT must be a positive integer".to_string())?;

        let max_redeliveries: u32 = or_default("MAX_REDELIVERIES", "1")
            .parse()
            .map_err(|_| "MAX_REDELIVERIES must be a non-negative integer".to_string())?;

        let host = or_default("HOST", "0.0.0.0");
        let port: u16 = or_default("PORT", "8099")
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        Ok(Config {
            bus_type,
            nats_url,
            consumer_group,
            topics,
            invocation,
            max_in_flight: max_in_flight.max(1),
            max_redeliveries,
            host,
            port,
        })
    }

    /// Retry budget for one record: the first attempt plus `max_redeliveries`
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_redeliveries(self.max_redeliveries)
    }

    /// How long the broker waits for a settlement before redelivering
    ///
    /// Up to `max_in_flight` unsettled records may queue in one partition lane,
    /// and each of them can run every attempt to its invocation timeout.
    pub fn ack_wait(&self) -> Duration {
        let retry = self.retry();
        let lifecycle = (self.invocation.timeout + PUBLISH_ALLOWANCE)
            .saturating_mul(retry.max_attempts)
            .saturating_add(retry.total_backoff());
        let pending = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        lifecycle.saturating_mul(pending)
    }
}

/// Trim, drop empties and duplicates, keep first-seen order
pub fn ordered_set<I, S>(topics: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set: Vec<String> = Vec::new();
    for topic in topics {
        let topic = topic.as_ref().trim();
        if !topic.is_empty() && !set.iter().any(|t| t == topic) {
            set.push(topic.to_string());
        }
    }
    set
}
