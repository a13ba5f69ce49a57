//! Prometheus metrics for the relay.
//!
//! All metrics follow the naming convention: `relay_<subject>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: request outcomes, publish failures, discarded responses
//! - **Gauge**: requests currently awaiting a reply
//! - **Histogram**: publish-to-reply round trip

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Relay metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // REQUEST OUTCOMES
    // =========================================================================

    /// Requests published to the request topic
    pub static ref REQUESTS_PUBLISHED: IntCounter = IntCounter::new(
        "relay_requests_published_total",
        "Total requests accepted by the broker"
    ).expect("metric creation failed");

    /// Requests resolved with a reply
    pub static ref REQUESTS_RESOLVED: IntCounter = IntCounter::new(
        "relay_requests_resolved_total",
        "Total requests resolved with a correlated reply"
    ).expect("metric creation failed");

    /// Requests whose deadline elapsed
    pub static ref REQUESTS_TIMED_OUT: IntCounter = IntCounter::new(
        "relay_requests_timed_out_total",
        "Total requests that timed out waiting for a reply"
    ).expect("metric creation failed");

    /// Requests force-resolved by shutdown
    pub static ref REQUESTS_SHUTDOWN: IntCounter = IntCounter::new(
        "relay_requests_shutdown_total",
        "Total pending requests released by shutdown"
    ).expect("metric creation failed");

    /// Publish attempts rejected by the broker
    pub static ref PUBLISH_FAILURES: IntCounter = IntCounter::new(
        "relay_publish_failures_total",
        "Total publish attempts that failed at the transport level"
    ).expect("metric creation failed");

    // =========================================================================
    // INBOUND RESPONSES
    // =========================================================================

    /// Replies with no matching waiter
    pub static ref RESPONSES_UNMATCHED: IntCounter = IntCounter::new(
        "relay_responses_unmatched_total",
        "Total replies discarded because no request was waiting"
    ).expect("metric creation failed");

    /// Inbound messages that failed to decode
    pub static ref RESPONSES_MALFORMED: IntCounter = IntCounter::new(
        "relay_responses_malformed_total",
        "Total inbound messages discarded as malformed"
    ).expect("metric creation failed");

    /// Requests currently waiting
    pub static ref PENDING_REQUESTS: IntGauge = IntGauge::new(
        "relay_pending_requests",
        "Number of requests currently awaiting a reply"
    ).expect("metric creation failed");

    /// Round trip from registration to reply
    pub static ref ROUND_TRIP_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "relay_round_trip_seconds",
            "Time from request registration to correlated reply"
        ).buckets(exponential_buckets(0.001, 2.0, 16).expect("bucket layout"))
    ).expect("metric creation failed");
}

/// Register all relay metrics with [`REGISTRY`].
///
/// Safe to call more than once.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(REQUESTS_PUBLISHED.clone()),
        Box::new(REQUESTS_RESOLVED.clone()),
        Box::new(REQUESTS_TIMED_OUT.clone()),
        Box::new(REQUESTS_SHUTDOWN.clone()),
        Box::new(PUBLISH_FAILURES.clone()),
        Box::new(RESPONSES_UNMATCHED.clone()),
        Box::new(RESPONSES_MALFORMED.clone()),
        Box::new(PENDING_REQUESTS.clone()),
        Box::new(ROUND_TRIP_SECONDS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_is_idempotent() {
        assert!(register_metrics().is_ok());
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_counter_increment() {
        let before = REQUESTS_PUBLISHED.get();
        REQUESTS_PUBLISHED.inc();
        assert!(REQUESTS_PUBLISHED.get() > before);
    }

    #[test]
    fn test_gather_contains_relay_metrics() {
        register_metrics().unwrap();
        RESPONSES_UNMATCHED.inc();
        ROUND_TRIP_SECONDS.observe(0.01);

        let text = gather_metrics().unwrap();
        assert!(text.contains("relay_responses_unmatched_total"));
        assert!(text.contains("relay_round_trip_seconds_bucket"));
    }
}
