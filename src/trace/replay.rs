//! Trace replay
//!
//! Replays a persisted event log as a lazy sequence, preserving original
//! inter-event timing (scaled by `speed`), skipping it entirely
//! (`fast_forward`), or advancing one event per call (`step`).

use std::io::BufRead;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::event::{EventFilter, TraceEvent};

/// How replay paces event production
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Sleep the original inter-event delta divided by `speed`
    #[default]
    Full,
    /// Produce events as fast as the consumer pulls them
    FastForward,
    /// Each `next_event` call is an external tick; no sleeping
    Step,
}

/// Replay configuration
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Pacing mode
    pub mode: ReplayMode,

    /// Time scale for `Full` mode; 2.0 replays twice as fast
    pub speed: f64,

    /// Skip events before this instant
    pub start_at: Option<DateTime<Utc>>,

    /// Stop at the first event at or after this instant
    pub stop_at: Option<DateTime<Utc>>,

    /// Additional event filter
    pub filter: Option<EventFilter>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            mode: ReplayMode::Full,
            speed: 1.0,
            start_at: None,
            stop_at: None,
            filter: None,
        }
    }
}

impl ReplayOptions {
    /// Options for timing-free replay
    pub fn fast_forward() -> Self {
        Self {
            mode: ReplayMode::FastForward,
            ..Self::default()
        }
    }

    /// Options for externally-ticked replay
    pub fn stepped() -> Self {
        Self {
            mode: ReplayMode::Step,
            ..Self::default()
        }
    }

    /// Set the time scale
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = if speed > 0.0 { speed } else { 1.0 };
        self
    }

    /// Set the replay window
    pub fn with_window(mut self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        self.start_at = Some(start);
        self.stop_at = Some(stop);
        self
    }

    /// Set an event filter
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// One replayed event with its timing context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEvent {
    /// The persisted event
    pub original: TraceEvent,

    /// When this event was produced by the replay
    pub replay_timestamp: DateTime<Utc>,

    /// Original delta to the preceding replayed event, in milliseconds
    pub time_delta_ms: i64,

    /// 1-based position within the replay
    pub sequence_position: usize,

    /// Total events in the replay
    pub total_events: usize,
}

/// A lazy replay over a loaded event list
pub struct ReplaySession {
    events: Vec<TraceEvent>,
    position: usize,
    options: ReplayOptions,
    previous_timestamp: Option<DateTime<Utc>>,
}

impl ReplaySession {
    /// Build a replay over `events`, applying the window and filter
    pub fn new(events: Vec<TraceEvent>, options: ReplayOptions) -> Self {
        let events: Vec<TraceEvent> = events
            .into_iter()
            .filter(|event| {
                if let Some(start) = options.start_at {
                    if event.timestamp < start {
                        return false;
                    }
                }
                if let Some(stop) = options.stop_at {
                    if event.timestamp >= stop {
                        return false;
                    }
                }
                options
                    .filter
                    .as_ref()
                    .map(|f| f.matches(event))
                    .unwrap_or(true)
            })
            .collect();

        Self {
            events,
            position: 0,
            options,
            previous_timestamp: None,
        }
    }

    /// Build a replay from a JSONL stream of processed events
    pub fn from_jsonl<R: BufRead>(reader: R, options: ReplayOptions) -> Result<Self> {
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(Self::new(events, options))
    }

    /// Total events this replay will produce
    pub fn total_events(&self) -> usize {
        self.events.len()
    }

    /// Events not yet produced
    pub fn remaining(&self) -> usize {
        self.events.len() - self.position
    }

    /// Produce the next event
    ///
    /// In `Full` mode this sleeps the original inter-event delta divided by
    /// `speed` before returning. `FastForward` never sleeps. In `Step` mode
    /// each call is the external tick, so it never sleeps either.
    pub fn next_event(&mut self) -> Option<ReplayEvent> {
        let event = self.events.get(self.position)?.clone();
        self.position += 1;

        let time_delta_ms = self
            .previous_timestamp
            .map(|prev| (event.timestamp - prev).num_milliseconds())
            .unwrap_or(0);
        self.previous_timestamp = Some(event.timestamp);

        if self.options.mode == ReplayMode::Full && time_delta_ms > 0 {
            let scaled = (time_delta_ms as f64 / self.options.speed).max(0.0);
            std::thread::sleep(Duration::from_millis(scaled as u64));
        }

        Some(ReplayEvent {
            original: event,
            replay_timestamp: Utc::now(),
            time_delta_ms,
            sequence_position: self.position,
            total_events: self.events.len(),
        })
    }
}

impl Iterator for ReplaySession {
    type Item = ReplayEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::event::{EventSource, EventType, Severity};
    use crate::trace::VERSION;
    use serde_json::json;

    fn event(sequence: u64, at_seconds: i64, name: &str) -> TraceEvent {
        let mut event = TraceEvent {
            trace_version: VERSION.to_string(),
            event_id: format!("evt-{}", sequence),
            session_id: "session-1".to_string(),
            trace_id: "trace-1".to_string(),
            span_id: "span-1".to_string(),
            parent_span_id: None,
            event_type: EventType::new(name),
            severity: Severity::Info,
            sequence,
            timestamp: DateTime::from_timestamp(1_700_000_000 + at_seconds, 0).unwrap(),
            payload: json!({"n": sequence}),
            artifacts: vec![],
            source: EventSource::default(),
            previous_event_hash: String::new(),
            event_hash: String::new(),
        };
        event.event_hash = event.compute_hash();
        event
    }

    #[test]
    fn test_fast_forward_produces_all_with_deltas() {
        let events = vec![
            event(1, 0, "session.started"),
            event(2, 2, "carp.request.received"),
            event(3, 5, "carp.resolution.completed"),
        ];
        let replayed: Vec<ReplayEvent> =
            ReplaySession::new(events, ReplayOptions::fast_forward()).collect();

        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].time_delta_ms, 0);
        assert_eq!(replayed[1].time_delta_ms, 2000);
        assert_eq!(replayed[2].time_delta_ms, 3000);
        assert_eq!(replayed[0].sequence_position, 1);
        assert_eq!(replayed[2].sequence_position, 3);
        assert_eq!(replayed[2].total_events, 3);
    }

    #[test]
    fn test_window_bounds_replay() {
        let events = vec![
            event(1, 0, "session.started"),
            event(2, 10, "carp.request.received"),
            event(3, 20, "session.ended"),
        ];
        let options = ReplayOptions::fast_forward().with_window(
            DateTime::from_timestamp(1_700_000_005, 0).unwrap(),
            DateTime::from_timestamp(1_700_000_015, 0).unwrap(),
        );
        let replayed: Vec<ReplayEvent> = ReplaySession::new(events, options).collect();

        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].original.sequence, 2);
    }

    #[test]
    fn test_filter_applies() {
        let events = vec![
            event(1, 0, "session.started"),
            event(2, 1, "carp.request.received"),
            event(3, 2, "carp.resolution.completed"),
        ];
        let options = ReplayOptions::fast_forward().with_filter(
            EventFilter::default().with_event_types(vec!["carp.*".to_string()]),
        );
        let replayed: Vec<ReplayEvent> = ReplaySession::new(events, options).collect();

        assert_eq!(replayed.len(), 2);
        assert!(replayed
            .iter()
            .all(|r| r.original.event_type.root() == "carp"));
    }

    #[test]
    fn test_step_mode_advances_one_per_call() {
        let events = vec![event(1, 0, "a.b"), event(2, 100, "a.c")];
        let mut session = ReplaySession::new(events, ReplayOptions::stepped());

        assert_eq!(session.remaining(), 2);
        let first = session.next_event().unwrap();
        assert_eq!(first.sequence_position, 1);
        assert_eq!(session.remaining(), 1);
        assert!(session.next_event().is_some());
        assert!(session.next_event().is_none());
    }

    #[test]
    fn test_from_jsonl() {
        let lines: Vec<String> = (1..=3)
            .map(|n| serde_json::to_string(&event(n, n as i64, "a.b")).unwrap())
            .collect();
        let input = lines.join("\n");

        let session =
            ReplaySession::from_jsonl(input.as_bytes(), ReplayOptions::fast_forward()).unwrap();
        assert_eq!(session.total_events(), 3);
    }
}
