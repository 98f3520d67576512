use metrics::Label;

use crate::context::TelemetryLabels;

pub const MESSAGES_SENT: &str = "relay_messages_sent_total";
pub const MESSAGES_FAILED: &str = "relay_messages_failed_total";
pub const MESSAGES_RETRIED: &str = "relay_messages_retried_total";
pub const WEBHOOK_EVENTS: &str = "relay_webhook_events_total";
pub const INSTANCE_SELF_HEALED: &str = "relay_instance_self_healed_total";
pub const ACTIONS_COMPLETED: &str = "relay_actions_completed_total";
pub const ACTIONS_FAILED: &str = "relay_actions_failed_total";
pub const ACTIONS_RESCHEDULED: &str = "relay_actions_rescheduled_total";
pub const DEAD_LETTERS: &str = "relay_dead_letters_total";
pub const ADAPTER_LATENCY: &str = "relay_adapter_call_seconds";

fn to_labels(labels: &TelemetryLabels) -> Vec<Label> {
    labels
        .tags()
        .into_iter()
        .map(|(k, v)| Label::new(k, v))
        .collect()
}

pub fn record_counter(name: &'static str, value: u64, labels: &TelemetryLabels) {
    metrics::counter!(name, to_labels(labels)).increment(value);
}

pub fn record_histogram(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::histogram!(name, to_labels(labels)).record(value);
}
