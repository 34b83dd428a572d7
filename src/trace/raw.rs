//! Raw TRACE events prior to sequencing and hashing
//!
//! A `RawEvent` is what the hot path produces: no sequence, no hashes, no
//! event id. It is moved into the ring buffer and owned by the background
//! processor from then on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{EventType, Severity};

/// An unsequenced, unhashed trace event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Session this event belongs to
    pub session_id: String,

    /// Trace ID grouping related events
    pub trace_id: String,

    /// Hierarchical dotted event name
    pub event_type: EventType,

    /// Event-specific payload data
    pub payload: Value,

    /// When this event was recorded
    pub timestamp: DateTime<Utc>,

    /// Span this event was recorded under
    pub span_id: String,

    /// Parent span for nested operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Event severity
    pub severity: Severity,
}

impl RawEvent {
    /// Create a raw event with info severity
    pub fn new(
        session_id: impl Into<String>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        event_type: EventType,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            trace_id: trace_id.into(),
            event_type,
            payload,
            timestamp,
            span_id: span_id.into(),
            parent_span_id: None,
            severity: Severity::Info,
        }
    }

    /// Set the parent span
    pub fn with_parent_span(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Set the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}
