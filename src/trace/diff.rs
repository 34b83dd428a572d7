//! Structural trace comparison
//!
//! Compares an expected and an actual event list pairwise by index after
//! dropping ignored event types, yielding path-addressed differences and
//! an overall compatibility verdict.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::TraceEvent;

/// Fields ignored by default: run-specific identity and chain metadata
pub const DEFAULT_IGNORED_FIELDS: [&str; 5] = [
    "event_id",
    "timestamp",
    "event_hash",
    "previous_event_hash",
    "sequence",
];

/// Diff configuration
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Top-level event fields excluded from comparison
    pub ignore_fields: Vec<String>,

    /// Event type names dropped from both lists before pairing
    pub ignore_event_types: Vec<String>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            ignore_fields: DEFAULT_IGNORED_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_event_types: vec![],
        }
    }
}

impl DiffOptions {
    /// Also ignore the given top-level fields
    pub fn with_ignored_fields(mut self, fields: Vec<String>) -> Self {
        self.ignore_fields.extend(fields);
        self
    }

    /// Drop events of the given types before comparison
    pub fn with_ignored_event_types(mut self, types: Vec<String>) -> Self {
        self.ignore_event_types = types;
        self
    }
}

/// Kind of difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Present only in the actual trace
    Added,
    /// Present only in the expected trace
    Removed,
    /// Present in both with different values
    Modified,
}

/// Severity of a difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffSeverity {
    /// Cosmetic
    Info,
    /// Metadata drift; behavior preserved
    Warning,
    /// Behavioral difference
    Error,
}

/// One structural difference between two traces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDifference {
    /// Added, removed, or modified
    pub kind: DiffKind,

    /// JSON path of the difference, e.g. `[3].payload.goal`
    pub path: String,

    /// Value on the expected side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,

    /// Value on the actual side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,

    /// How much this difference matters
    pub severity: DiffSeverity,
}

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    /// No differences at all
    Identical,
    /// Only info/warning differences
    Compatible,
    /// At least one error-severity difference
    Breaking,
}

/// Result of comparing two traces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDiff {
    /// All differences found, in path order of discovery
    pub differences: Vec<TraceDifference>,

    /// Overall verdict
    pub compatibility: Compatibility,

    /// Events compared on the expected side (after type filtering)
    pub expected_count: usize,

    /// Events compared on the actual side (after type filtering)
    pub actual_count: usize,
}

impl TraceDiff {
    /// Whether the traces are behaviorally equivalent
    pub fn is_compatible(&self) -> bool {
        !matches!(self.compatibility, Compatibility::Breaking)
    }
}

/// Trace comparison engine
pub struct TraceDiffer;

impl TraceDiffer {
    /// Compare `expected` against `actual`
    pub fn diff(
        expected: &[TraceEvent],
        actual: &[TraceEvent],
        options: &DiffOptions,
    ) -> TraceDiff {
        let expected: Vec<&TraceEvent> = expected
            .iter()
            .filter(|e| !options.ignore_event_types.contains(&e.event_type.as_str().to_string()))
            .collect();
        let actual: Vec<&TraceEvent> = actual
            .iter()
            .filter(|e| !options.ignore_event_types.contains(&e.event_type.as_str().to_string()))
            .collect();

        let mut differences = Vec::new();
        let common = expected.len().min(actual.len());

        for i in 0..common {
            Self::diff_events(i, expected[i], actual[i], options, &mut differences);
        }

        // Events present only on one side
        for (i, event) in expected.iter().enumerate().skip(common) {
            differences.push(TraceDifference {
                kind: DiffKind::Removed,
                path: format!("[{}]", i),
                expected: Some(Value::String(event.event_type.as_str().to_string())),
                actual: None,
                severity: DiffSeverity::Error,
            });
        }
        for (i, event) in actual.iter().enumerate().skip(common) {
            differences.push(TraceDifference {
                kind: DiffKind::Added,
                path: format!("[{}]", i),
                expected: None,
                actual: Some(Value::String(event.event_type.as_str().to_string())),
                severity: DiffSeverity::Warning,
            });
        }

        let compatibility = if differences.is_empty() {
            Compatibility::Identical
        } else if differences
            .iter()
            .any(|d| d.severity == DiffSeverity::Error)
        {
            Compatibility::Breaking
        } else {
            Compatibility::Compatible
        };

        TraceDiff {
            differences,
            compatibility,
            expected_count: expected.len(),
            actual_count: actual.len(),
        }
    }

    fn diff_events(
        index: usize,
        expected: &TraceEvent,
        actual: &TraceEvent,
        options: &DiffOptions,
        out: &mut Vec<TraceDifference>,
    ) {
        let mut expected_value = serde_json::to_value(expected).unwrap_or_default();
        let mut actual_value = serde_json::to_value(actual).unwrap_or_default();

        for value in [&mut expected_value, &mut actual_value] {
            if let Some(map) = value.as_object_mut() {
                for field in &options.ignore_fields {
                    map.remove(field);
                }
            }
        }

        Self::diff_values(
            &format!("[{}]", index),
            &expected_value,
            &actual_value,
            out,
        );
    }

    fn diff_values(path: &str, expected: &Value, actual: &Value, out: &mut Vec<TraceDifference>) {
        match (expected, actual) {
            (Value::Object(e), Value::Object(a)) => {
                let mut keys: Vec<&String> = e.keys().chain(a.keys()).collect();
                keys.sort();
                keys.dedup();
                for key in keys {
                    let child_path = format!("{}.{}", path, key);
                    match (e.get(key.as_str()), a.get(key.as_str())) {
                        (Some(ev), Some(av)) => Self::diff_values(&child_path, ev, av, out),
                        (Some(ev), None) => out.push(TraceDifference {
                            kind: DiffKind::Removed,
                            path: child_path.clone(),
                            expected: Some(ev.clone()),
                            actual: None,
                            severity: Self::severity_for(&child_path),
                        }),
                        (None, Some(av)) => out.push(TraceDifference {
                            kind: DiffKind::Added,
                            path: child_path.clone(),
                            expected: None,
                            actual: Some(av.clone()),
                            severity: Self::severity_for(&child_path),
                        }),
                        (None, None) => {}
                    }
                }
            }
            (Value::Array(e), Value::Array(a)) => {
                let common = e.len().min(a.len());
                for i in 0..common {
                    Self::diff_values(&format!("{}[{}]", path, i), &e[i], &a[i], out);
                }
                for (i, item) in e.iter().enumerate().skip(common) {
                    out.push(TraceDifference {
                        kind: DiffKind::Removed,
                        path: format!("{}[{}]", path, i),
                        expected: Some(item.clone()),
                        actual: None,
                        severity: Self::severity_for(path),
                    });
                }
                for (i, item) in a.iter().enumerate().skip(common) {
                    out.push(TraceDifference {
                        kind: DiffKind::Added,
                        path: format!("{}[{}]", path, i),
                        expected: None,
                        actual: Some(item.clone()),
                        severity: Self::severity_for(path),
                    });
                }
            }
            (e, a) => {
                if e != a {
                    out.push(TraceDifference {
                        kind: DiffKind::Modified,
                        path: path.to_string(),
                        expected: Some(e.clone()),
                        actual: Some(a.clone()),
                        severity: Self::severity_for(path),
                    });
                }
            }
        }
    }

    /// Payload and event-type differences are behavioral; the rest
    /// (span ids, severity, source) is metadata drift
    fn severity_for(path: &str) -> DiffSeverity {
        if path.contains(".payload") || path.contains(".event_type") {
            DiffSeverity::Error
        } else {
            DiffSeverity::Warning
        }
    }
}
