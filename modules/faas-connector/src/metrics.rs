use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub records_total: IntCounterVec,
    pub sends_total: IntCounterVec,

    // Histograms
    pub invocation_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let records_total = IntCounterVec::new(
            Opts::new("connector_records_total", "Consumed records by final outcome"),
            &["outcome"], // forwarded|expired|invocation_failed|poison|publish_failed
        )?;

        let sends_total = IntCounterVec::new(
            Opts::new("connector_sends_total", "Envelopes accepted by the broker"),
            &["kind"], // destination|test|invalid
        )?;

        let invocation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "connector_invocation_duration_seconds",
                "Function invocation duration seconds",
            ),
            &["result"], // ok|error
        )?;

        registry.register(Box::new(records_total.clone()))?;
        registry.register(Box::new(sends_total.clone()))?;
        registry.register(Box::new(invocation_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            records_total,
            sends_total,
            invocation_duration_seconds,
        })
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.records_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_send(&self, kind: &str) {
        self.sends_total.with_label_values(&[kind]).inc();
    }

    pub fn observe_invocation(&self, result: &str, seconds: f64) {
        self.invocation_duration_seconds
            .with_label_values(&[result])
            .observe(seconds);
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}
