//! Telemetry helpers for relay services.
//!
//! Wires `tracing` output (JSON or plain) with optional OTLP export, and
//! exposes counter/histogram recorders on top of the `metrics` facade.

use anyhow::Result;

mod config;
mod context;
mod recorder;
mod tracing_init;

pub use config::{TelemetryConfig, TelemetryProtocol};
pub use context::TelemetryLabels;
pub use recorder::{
    ACTIONS_COMPLETED, ACTIONS_FAILED, ACTIONS_RESCHEDULED, ADAPTER_LATENCY, DEAD_LETTERS,
    INSTANCE_SELF_HEALED, MESSAGES_FAILED, MESSAGES_RETRIED, MESSAGES_SENT, WEBHOOK_EVENTS,
    record_counter, record_histogram,
};
pub use tracing_init::{init_telemetry, shutdown_telemetry, with_common_fields};

/// Installs the process subscriber configured from the environment.
pub fn install(service_name: &str, service_version: &str) -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name, service_version))
}
