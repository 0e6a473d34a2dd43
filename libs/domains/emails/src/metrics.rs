//! Prometheus counters for the email pipeline.
//!
//! Recorded through the `metrics` facade; the binary installs the exporter.

use metrics::{counter, histogram};
use std::time::Duration;

pub fn email_created() {
    counter!("emails_created_total").increment(1);
}

pub fn event_published(republish: bool) {
    counter!(
        "emails_events_published_total",
        "republish" => if republish { "true" } else { "false" }
    )
    .increment(1);
}

pub fn publish_failed(reason: &'static str) {
    counter!("emails_publish_failures_total", "reason" => reason).increment(1);
}

/// Terminal outcome of a delivery: `sent` or `failed`.
pub fn delivery_finished(outcome: &'static str) {
    counter!("emails_deliveries_total", "outcome" => outcome).increment(1);
}

/// A delivery skipped because the record already reached a terminal status.
pub fn duplicate_skipped() {
    counter!("emails_duplicate_deliveries_total").increment(1);
}

pub fn send_attempt(outcome: &'static str, duration: Duration) {
    counter!("emails_send_attempts_total", "outcome" => outcome).increment(1);
    histogram!("emails_send_attempt_duration_seconds").record(duration.as_secs_f64());
}

pub fn cache_lookup(hit: bool) {
    counter!(
        "emails_cache_lookups_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

pub fn cache_error(op: &'static str) {
    counter!("emails_cache_errors_total", "op" => op).increment(1);
}

pub fn stale_republished() {
    counter!("emails_sweeper_republished_total").increment(1);
}
