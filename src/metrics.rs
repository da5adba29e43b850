//! Feed pipeline metrics
//!
//! Prometheus counters for the event pipeline. Publish and fan-out failures
//! never abort their caller, so these counters are the operator's only
//! signal for reconciliation.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_events_total",
        "Feed events processed by workers (by type and outcome)",
        &["event", "status"]
    )
    .expect("Failed to register feed events metric")
});

static FANOUT_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_fanout_failures_total",
        "Per-recipient cache mutations that failed during fan-out",
        &["event"]
    )
    .expect("Failed to register fan-out failures metric")
});

static PUBLISH_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_publish_failures_total",
        "Events that committed locally but failed to publish",
        &["event"]
    )
    .expect("Failed to register publish failures metric")
});

static MALFORMED_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_events_malformed_total",
        "Stream messages whose payload could not be decoded",
        &["stream"]
    )
    .expect("Failed to register malformed events metric")
});

static CACHE_WARMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_cache_warms_total",
        "Cold-cache warm attempts (by outcome)",
        &["status"]
    )
    .expect("Failed to register cache warms metric")
});

/// Record a processed event and its outcome ("ok" / "error")
pub fn record_event(event: &str, status: &str) {
    EVENTS_TOTAL.with_label_values(&[event, status]).inc();
}

/// Record per-recipient fan-out failures for an event type
pub fn record_fanout_failures(event: &str, count: u64) {
    if count > 0 {
        FANOUT_FAILURES_TOTAL.with_label_values(&[event]).inc_by(count);
    }
}

/// Record an event that committed but could not be published
pub fn record_publish_failure(event: &str) {
    PUBLISH_FAILURES_TOTAL.with_label_values(&[event]).inc();
}

/// Record a stream message with an undecodable payload
pub fn record_malformed(stream: &str) {
    MALFORMED_EVENTS_TOTAL.with_label_values(&[stream]).inc();
}

/// Record a cold-cache warm attempt ("ok" / "empty" / "error")
pub fn record_cache_warm(status: &str) {
    CACHE_WARMS_TOTAL.with_label_values(&[status]).inc();
}
