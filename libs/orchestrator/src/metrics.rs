use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

#[derive(Clone)]
pub struct Metrics {
    executions: Counter<u64>,
    execution_duration: Histogram<f64>,
    state_saved_bytes: Counter<u64>,
    sessions_swept: Counter<u64>,
    pool_pods: Gauge<i64>,
    pool_available: Gauge<i64>,
}

impl Metrics {
    pub fn new(meter: &Meter) -> Self {
        let executions = meter
            .u64_counter("executions")
            .with_description("Number of code executions dispatched, by language, status and pod source")
            .build();

        let execution_duration = meter
            .f64_histogram("execution_duration_seconds")
            .with_description("Wall-clock duration of code executions")
            .build();

        let state_saved_bytes = meter
            .u64_counter("state_saved_bytes")
            .with_description("Decoded bytes of interpreter state written to the hot tier")
            .build();

        let sessions_swept = meter
            .u64_counter("sessions_swept")
            .with_description("Expired sessions removed by the sweep")
            .build();

        let pool_pods = meter
            .i64_gauge("pool_pods")
            .with_description("Pods in the warm pool per language")
            .build();

        let pool_available = meter
            .i64_gauge("pool_pods_available")
            .with_description("Unacquired warm pods per language")
            .build();

        Self {
            executions,
            execution_duration,
            state_saved_bytes,
            sessions_swept,
            pool_pods,
            pool_available,
        }
    }

    pub fn execution_recorded(&self, language: &str, status: &str, source: &str, seconds: f64) {
        let attrs = [
            KeyValue::new("language", language.to_string()),
            KeyValue::new("status", status.to_string()),
            KeyValue::new("pod_source", source.to_string()),
        ];
        self.executions.add(1, &attrs);
        self.execution_duration.record(seconds, &attrs);
    }

    pub fn state_saved(&self, bytes: u64) {
        self.state_saved_bytes.add(bytes, &[]);
    }

    pub fn sessions_swept_add(&self, count: u64) {
        self.sessions_swept.add(count, &[]);
    }

    pub fn pool_observed(&self, language: &str, total: usize, available: usize) {
        let attrs = [KeyValue::new("language", language.to_string())];
        self.pool_pods.record(total as i64, &attrs);
        self.pool_available.record(available as i64, &attrs);
    }
}
