//! Write-only metrics surface for the limiter.
//!
//! The core reports into an injected observer and owns no registries; wiring
//! an exporter is the node binary's concern.

use metrics::{counter, histogram};

/// Traffic direction, used to tag limiter metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

/// Observer the rate-limiting layer reports into.
pub trait LimiterMetrics: Send + Sync {
    /// One unit of work examined by the limiter.
    fn packet_processed(&self, direction: Direction);

    /// A unit denied because the budget was exhausted.
    fn limit_exceeded(&self, direction: Direction);

    /// Size in bytes of a processed unit.
    fn observe_size(&self, bytes: u64);

    /// A persistence failure that was answered with a deny.
    fn store_failure(&self);
}

/// Discards every signal. For tests and metric-less deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl LimiterMetrics for NoopMetrics {
    fn packet_processed(&self, _direction: Direction) {}
    fn limit_exceeded(&self, _direction: Direction) {}
    fn observe_size(&self, _bytes: u64) {}
    fn store_failure(&self) {}
}

/// Forwards to the process-wide `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayMetrics;

impl LimiterMetrics for RelayMetrics {
    fn packet_processed(&self, direction: Direction) {
        counter!("murmur_rate_limits_processed_total", 1, "type" => direction.as_str());
    }

    fn limit_exceeded(&self, direction: Direction) {
        counter!("murmur_rate_limits_exceeded_total", 1, "type" => direction.as_str());
    }

    fn observe_size(&self, bytes: u64) {
        histogram!("murmur_envelope_size_bytes", bytes as f64);
    }

    fn store_failure(&self) {
        counter!("murmur_rate_limit_store_failures_total", 1);
    }
}
