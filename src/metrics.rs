//! Metric instruments.
//!
//! Centralized counter definitions using OpenTelemetry meters, lazily
//! initialized. Exporter wiring is the host application's concern; without
//! one these are no-ops.

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("eventum"));

/// Commands dispatched successfully, by command type.
pub static COMMANDS_DISPATCHED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventum.commands.dispatched")
        .with_description("Commands dispatched")
        .build()
});

/// Commands whose dispatch failed, by command type.
pub static COMMANDS_FAILED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventum.commands.failed")
        .with_description("Commands failed")
        .build()
});

/// Events dispatched successfully, by event type.
pub static EVENTS_DISPATCHED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventum.events.dispatched")
        .with_description("Events dispatched")
        .build()
});

/// Events whose dispatch failed, by event type.
pub static EVENTS_FAILED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventum.events.failed")
        .with_description("Events failed")
        .build()
});

/// Events published to the event bus, by event type.
pub static EVENTS_PUBLISHED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventum.events.published")
        .with_description("Events published")
        .build()
});

/// Publish calls that exhausted their retries.
pub static PUBLISH_FAILURES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventum.publish.failures")
        .with_description("Publish failures")
        .build()
});

/// Create a command-type label.
pub fn command_attr(command_type: &str) -> KeyValue {
    KeyValue::new("command", command_type.to_string())
}

/// Create an event-type label.
pub fn event_attr(event_type: &str) -> KeyValue {
    KeyValue::new("event", event_type.to_string())
}
