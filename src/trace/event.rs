//! Processed TRACE event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ident::{canonical_json, sha256_hex};

use super::VERSION;

/// Hierarchical dotted event name, e.g. `carp.resolution.completed`
///
/// Span lifecycle events derive their names from the span
/// (`<span>.started`, `<span>.completed`, `<span>.failed`), so the set of
/// names is open-ended rather than a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Create an event type from a dotted name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The full dotted name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first segment of the name (`carp`, `atlas`, `session`, ...)
    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// The last segment of the name (`completed`, `failed`, ...)
    pub fn leaf(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Well-known event names emitted by the runtime
pub mod event_names {
    /// Session lifecycle
    pub const SESSION_STARTED: &str = "session.started";
    /// Session lifecycle
    pub const SESSION_ENDED: &str = "session.ended";

    /// Resolution pipeline
    pub const REQUEST_RECEIVED: &str = "carp.request.received";
    /// Resolution pipeline
    pub const RESOLUTION_CACHE_HIT: &str = "carp.resolution.cache_hit";
    /// Resolution pipeline
    pub const RESOLUTION_COMPLETED: &str = "carp.resolution.completed";
    /// Resolution pipeline
    pub const RESOLUTION_CANCELLED: &str = "carp.resolution.cancelled";
    /// Resolution pipeline
    pub const ATLAS_LOAD: &str = "atlas.load";
    /// Resolution pipeline
    pub const CONTEXT_SELECTED: &str = "carp.context.selected";
    /// Resolution pipeline
    pub const CONTEXT_ASSEMBLED: &str = "carp.context.assembled";
    /// Resolution pipeline
    pub const ACTIONS_RESOLVED: &str = "carp.actions.resolved";
    /// Policy evaluation
    pub const POLICY_EVALUATION_STARTED: &str = "carp.policy.evaluation.started";
    /// Policy evaluation
    pub const POLICY_EVALUATION_COMPLETED: &str = "carp.policy.evaluation.completed";
    /// Policy evaluation
    pub const POLICY_RULE_MATCHED: &str = "carp.policy.rule.matched";

    /// Execution pipeline
    pub const ACTION_REQUESTED: &str = "carp.action.requested";
    /// Execution pipeline
    pub const ACTION_DENIED: &str = "carp.action.denied";
    /// Execution pipeline
    pub const ACTION_APPROVAL_PENDING: &str = "carp.action.approval.pending";
    /// Execution pipeline
    pub const ACTION_APPROVED: &str = "carp.action.approved";
    /// Execution pipeline
    pub const ACTION_STARTED: &str = "carp.action.started";
    /// Execution pipeline
    pub const ACTION_COMPLETED: &str = "carp.action.completed";
    /// Execution pipeline
    pub const ACTION_FAILED: &str = "carp.action.failed";

    /// Error reporting
    pub const ERROR_VALIDATION: &str = "error.validation";
    /// Error reporting
    pub const ERROR_INTERNAL: &str = "error.internal";
}

/// Event severity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Diagnostic detail
    Debug,
    /// Normal operation
    #[default]
    Info,
    /// Degraded but recoverable
    Warn,
    /// Failure
    Error,
}

impl Severity {
    /// Lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The component that emitted an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    /// Emitting component name
    pub component: String,

    /// Component version
    pub version: String,

    /// Optional instance identifier for multi-process deployments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl Default for EventSource {
    fn default() -> Self {
        Self {
            component: "warden-core".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: None,
        }
    }
}

/// Inline artifact payloads are capped at 4 KiB; larger content is external
pub const INLINE_ARTIFACT_LIMIT: usize = 4096;

/// Where an artifact's content lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ArtifactStorage {
    /// Content carried inline in the event
    Inline {
        /// UTF-8 payload
        payload: String,
    },
    /// Content stored beside the trace log
    External {
        /// Relative file reference, `<artifact_id>-artifact.<ext>`
        reference: String,
    },
}

/// Reference to a captured artifact (tool output, file snapshot, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Unique artifact identifier
    pub artifact_id: String,

    /// Artifact kind (`output`, `file`, `screenshot`, ...)
    pub artifact_type: String,

    /// Human-readable name
    pub name: String,

    /// SHA-256 of the content bytes
    pub content_hash: String,

    /// Content size in bytes
    pub size_bytes: u64,

    /// MIME type
    pub mime_type: String,

    /// Inline or external storage
    pub storage: ArtifactStorage,
}

impl ArtifactRef {
    /// Build a reference from UTF-8 content, choosing inline storage when
    /// the content is under [`INLINE_ARTIFACT_LIMIT`]
    pub fn from_content(
        artifact_id: impl Into<String>,
        artifact_type: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        content: &str,
        extension: &str,
    ) -> Self {
        let artifact_id = artifact_id.into();
        let storage = if content.len() < INLINE_ARTIFACT_LIMIT {
            ArtifactStorage::Inline {
                payload: content.to_string(),
            }
        } else {
            ArtifactStorage::External {
                reference: format!("{}-artifact.{}", artifact_id, extension),
            }
        };
        Self {
            artifact_id,
            artifact_type: artifact_type.into(),
            name: name.into(),
            content_hash: sha256_hex(content.as_bytes()),
            size_bytes: content.len() as u64,
            mime_type: mime_type.into(),
            storage,
        }
    }
}

/// A processed TRACE event: sequenced, chained, and hashed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// TRACE protocol version (always "1.0")
    pub trace_version: String,

    /// Unique identifier for this event (UUIDv7)
    pub event_id: String,

    /// Session this event belongs to
    pub session_id: String,

    /// Trace ID grouping related events
    pub trace_id: String,

    /// Span this event was recorded under
    pub span_id: String,

    /// Parent span for nested operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Hierarchical dotted event name
    pub event_type: EventType,

    /// Event severity
    pub severity: Severity,

    /// Per-session sequence number; starts at 1, strictly monotonic, gap-free
    pub sequence: u64,

    /// When the raw event was recorded
    pub timestamp: DateTime<Utc>,

    /// Event-specific payload data
    pub payload: Value,

    /// Captured artifacts, if any
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub artifacts: Vec<ArtifactRef>,

    /// Emitting component
    pub source: EventSource,

    /// `event_hash` of the preceding event; empty for the genesis event
    pub previous_event_hash: String,

    /// SHA-256 of this event's canonical form excluding `event_hash`
    pub event_hash: String,
}

impl TraceEvent {
    /// Compute the SHA-256 hash of this event
    ///
    /// The hash input is the canonical JSON of the serialized event with
    /// the `event_hash` field removed. No other field is excluded.
    pub fn compute_hash(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("event_hash");
        }
        sha256_hex(canonical_json(&value).as_bytes())
    }

    /// Verify this event's stored hash against a recomputation
    pub fn verify_hash(&self) -> bool {
        self.event_hash == self.compute_hash()
    }

    /// Canonical JSON of this event (including `event_hash`)
    pub fn canonical(&self) -> String {
        canonical_json(&serde_json::to_value(self).unwrap_or_default())
    }
}

/// Filter over persisted events
///
/// An empty filter matches everything. `event_types` entries are glob
/// patterns over the dotted name (`carp.*`, `*.failed`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Restrict to one session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Inclusive lower bound on the event timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,

    /// Exclusive upper bound on the event timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,

    /// Glob patterns over event type names; empty matches all
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub event_types: Vec<String>,

    /// Minimum severity (floor)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,

    /// Restrict to specific spans; empty matches all
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub span_ids: Vec<String>,
}

impl EventFilter {
    /// Filter matching every event of one session
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Restrict to event types matching any of the given glob patterns
    pub fn with_event_types(mut self, patterns: Vec<String>) -> Self {
        self.event_types = patterns;
        self
    }

    /// Set the severity floor
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Restrict to a time window
    pub fn with_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_at = Some(start);
        self.end_at = Some(end);
        self
    }

    /// Whether `event` passes this filter
    pub fn matches(&self, event: &TraceEvent) -> bool {
        if let Some(session_id) = &self.session_id {
            if &event.session_id != session_id {
                return false;
            }
        }
        if let Some(start) = self.start_at {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_at {
            if event.timestamp >= end {
                return false;
            }
        }
        if let Some(floor) = self.min_severity {
            if event.severity < floor {
                return false;
            }
        }
        if !self.span_ids.is_empty() && !self.span_ids.iter().any(|s| s == &event.span_id) {
            return false;
        }
        if !self.event_types.is_empty() {
            let name = event.event_type.as_str();
            let matched = self.event_types.iter().any(|pattern| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(name))
                    .unwrap_or(false)
            });
            if !matched {
                return false;
            }
        }
        true
    }
}
