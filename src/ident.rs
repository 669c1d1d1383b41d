//! Opaque unique identifier generation for messages, events, and correlation.

use uuid::Uuid;

/// Returns a new opaque unique identifier string.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
