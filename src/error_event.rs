//! Standardized delivery of framework-level failures as integration events.
//!
//! When handling fails inside the framework (decode error, missing type,
//! handler failure), the error is recorded as a [`CqrsErrorEvent`] in the
//! integration log — never in a per-aggregate stream and never published —
//! so the trace survives without polluting aggregate histories.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::ident;
use crate::message::VersionedEvent;
use crate::storage::EventStreamRepository;

/// Stable wire name of the framework error event.
pub const CQRS_ERROR_EVENT_TYPE: &str = "cqrs.CQRSErrorEvent";

/// A framework-raised error, preserved for correlation-chain audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqrsErrorEvent {
    #[serde(rename = "Message")]
    pub message: String,
}

/// Writes a framework error into the integration log under the original
/// correlation id, with version 0 and an empty source id.
///
/// Recording is best-effort: a storage failure here is logged and dropped,
/// since the error being reported has already been surfaced elsewhere.
pub async fn deliver_cqrs_error(
    correlation_id: &str,
    message: impl Into<String>,
    store: &dyn EventStreamRepository,
) {
    let event = VersionedEvent {
        id: ident::new_id(),
        correlation_id: correlation_id.to_string(),
        source_id: String::new(),
        version: 0,
        event_type: CQRS_ERROR_EVENT_TYPE.to_string(),
        created: Utc::now(),
        event: Arc::new(CqrsErrorEvent {
            message: message.into(),
        }),
    };
    if let Err(err) = store.save_integration_event(&event).await {
        error!(correlation_id, error = %err, "failed to record framework error event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryEventStreamRepository;

    #[tokio::test]
    async fn error_lands_in_integration_log_only() {
        let store = InMemoryEventStreamRepository::new();
        deliver_cqrs_error("corr-9", "decode exploded", &store).await;

        let by_correlation = store
            .integration_events_by_correlation_id("corr-9")
            .await
            .expect("correlation query should succeed");
        assert_eq!(by_correlation.len(), 1);
        let event = &by_correlation[0];
        assert_eq!(event.version, 0);
        assert_eq!(event.source_id, "");
        assert_eq!(event.event_type, CQRS_ERROR_EVENT_TYPE);
        assert_eq!(
            event.event_as::<CqrsErrorEvent>().map(|e| e.message.as_str()),
            Some("decode exploded")
        );

        // Nothing entered any aggregate stream.
        let stream = store.get("", 1).await.expect("stream read should succeed");
        assert!(stream.is_empty());
    }
}
