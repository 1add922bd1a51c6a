use lazy_static::lazy_static;
use metrics::{describe_counter, describe_gauge, describe_histogram, Counter, Gauge, Histogram, Unit};
use std::sync::Arc;

pub struct RuntimeMetrics {
    // Actor lifecycle
    pub total_actors: Gauge,

    // Handler execution
    pub actor_command_throughput: Counter,
    pub actor_command_latency: Histogram,

    // Errors
    pub error_rate: Counter,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        let metrics = Self {
            total_actors: metrics::gauge!("murmur_runtime.total_actors"),
            actor_command_throughput: metrics::counter!("murmur_runtime.actor_command_throughput"),
            actor_command_latency: metrics::histogram!("murmur_runtime.actor_command_latency"),
            error_rate: metrics::counter!("murmur_runtime.error_rate"),
        };

        describe_gauge!("murmur_runtime.total_actors", "Total number of registered actors");
        describe_counter!("murmur_runtime.actor_command_throughput", "Number of handler runs across all actors");
        describe_histogram!(
            "murmur_runtime.actor_command_latency",
            Unit::Seconds,
            "Latency of a single handler run"
        );
        describe_counter!("murmur_runtime.error_rate", "Number of failed command deliveries");

        metrics
    }
}

lazy_static! {
    pub static ref METRICS: Arc<RuntimeMetrics> = Arc::new(RuntimeMetrics::new());
}
