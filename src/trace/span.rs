//! Span lifecycle types
//!
//! A span names a sub-region of a trace. It starts `in_progress` and ends
//! in exactly one terminal status; ending an already-terminal span is
//! idempotent and returns the stored span unchanged.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Span kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// In-process operation
    #[default]
    Internal,
    /// Outbound call
    Client,
    /// Inbound request handling
    Server,
}

/// Span status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    /// Still open
    InProgress,
    /// Ended successfully
    Ok,
    /// Ended with an error
    Error,
    /// Ended by deadline
    Timeout,
    /// Ended by cancellation
    Cancelled,
}

impl SpanStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SpanStatus::InProgress)
    }
}

/// Link to a span in another trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanLink {
    /// Linked trace
    pub trace_id: String,
    /// Linked span
    pub span_id: String,
}

/// A named sub-region of a trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Unique span identifier
    pub span_id: String,

    /// Trace this span belongs to
    pub trace_id: String,

    /// Parent span for nesting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Span name; also the prefix of its lifecycle event names
    pub name: String,

    /// Span kind
    pub kind: SpanKind,

    /// When the span was opened
    pub started_at: DateTime<Utc>,

    /// When the span ended; set iff the status is terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Current status
    pub status: SpanStatus,

    /// Free-form attributes
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub attributes: HashMap<String, Value>,

    /// Event ids recorded under this span
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<String>,

    /// Links to spans in other traces
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub links: Vec<SpanLink>,
}

impl Span {
    /// Open a new span
    pub fn start(
        span_id: impl Into<String>,
        trace_id: impl Into<String>,
        name: impl Into<String>,
        kind: SpanKind,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            span_id: span_id.into(),
            trace_id: trace_id.into(),
            parent_span_id: None,
            name: name.into(),
            kind,
            started_at,
            ended_at: None,
            status: SpanStatus::InProgress,
            attributes: HashMap::new(),
            events: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Set the parent span
    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Set an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Transition to a terminal status
    ///
    /// Returns `true` if the transition happened, `false` if the span was
    /// already terminal (in which case nothing changes).
    pub fn end(&mut self, status: SpanStatus, ended_at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        debug_assert!(status.is_terminal());
        self.status = status;
        self.ended_at = Some(ended_at);
        true
    }

    /// Span duration in milliseconds, if ended
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|ended| (ended - self.started_at).num_milliseconds())
    }
}

/// Options for opening a span via the collector
#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    /// Session the span's lifecycle events belong to
    pub session_id: String,
    /// Explicit trace id; defaults to the session's trace
    pub trace_id: Option<String>,
    /// Parent span for nesting
    pub parent_span_id: Option<String>,
    /// Span kind
    pub kind: SpanKind,
    /// Initial attributes
    pub attributes: HashMap<String, Value>,
}

impl SpanOptions {
    /// Options for a session-scoped internal span
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Set the parent span
    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Set the span kind
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_span_ends_once() {
        let mut span = Span::start("span-1", "trace-1", "carp.resolve", SpanKind::Internal, instant(0));
        assert_eq!(span.status, SpanStatus::InProgress);
        assert!(span.ended_at.is_none());

        assert!(span.end(SpanStatus::Ok, instant(2)));
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.duration_ms(), Some(2000));

        // Second end is a no-op
        assert!(!span.end(SpanStatus::Error, instant(5)));
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.duration_ms(), Some(2000));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SpanStatus::InProgress.is_terminal());
        for status in [
            SpanStatus::Ok,
            SpanStatus::Error,
            SpanStatus::Timeout,
            SpanStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
    }
}
