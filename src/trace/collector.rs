//! TRACE Collector facade
//!
//! The synchronous emission API used by the resolver. `record` stamps
//! session, trace, and span identifiers onto a raw event and pushes it to
//! the lock-free ring buffer; it performs no hashing, no I/O, and never
//! blocks. Hashing and persistence happen in the background processor.
//!
//! Observers subscribe through a bounded broadcast; a slow observer drops
//! messages rather than slowing emitters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::{json, Value};

use crate::error::{Result, WardenError};
use crate::ident::{IdSource, UuidV7Source};
use crate::session::{SessionInfo, SessionPatch, SessionState};
use crate::storage::StorageAdapter;
use crate::timing::{Clock, SystemClock};

use super::buffer::{BufferStats, TraceRingBuffer};
use super::chain::{ChainVerification, ChainVerifier};
use super::event::{event_names, EventFilter, EventType, Severity, TraceEvent};
use super::processor::{ProcessorConfig, ProcessorHandle, ProcessorStats, TraceProcessor};
use super::raw::RawEvent;
use super::span::{Span, SpanOptions, SpanStatus};

/// Collector configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Ring buffer capacity
    pub buffer_capacity: usize,

    /// Per-subscriber broadcast queue capacity
    pub broadcast_capacity: usize,

    /// Background processor configuration
    pub processor: ProcessorConfig,

    /// Upper bound on `flush`/`verify` waits
    pub flush_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: super::DEFAULT_BUFFER_CAPACITY,
            broadcast_capacity: 256,
            processor: ProcessorConfig::default(),
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl CollectorConfig {
    /// Set the ring buffer capacity
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the processor configuration
    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }
}

/// Outcome of a `record` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAck {
    /// Whether the event entered the buffer
    pub accepted: bool,
}

impl RecordAck {
    /// Whether the event was dropped on overflow
    pub fn dropped(&self) -> bool {
        !self.accepted
    }
}

/// Options for `record`
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    /// Session the event belongs to (required)
    pub session_id: String,
    /// Explicit trace id; defaults to the session's trace
    pub trace_id: Option<String>,
    /// Span to attribute the event to; defaults to a fresh span id
    pub span_id: Option<String>,
    /// Parent span for nesting
    pub parent_span_id: Option<String>,
    /// Event severity
    pub severity: Severity,
}

impl RecordOptions {
    /// Options for a session-scoped info event
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Attribute the event to a span
    pub fn with_span(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }

    /// Set the parent span
    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Set the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Bounded fan-out of processed events to in-process observers
///
/// `publish` uses `try_send`: a subscriber whose queue is full loses that
/// message, and emission is never blocked. Disconnected subscribers are
/// pruned on the next publish.
#[derive(Debug)]
pub struct EventBroadcast {
    capacity: usize,
    senders: Mutex<Vec<Sender<TraceEvent>>>,
    dropped: AtomicU64,
}

impl EventBroadcast {
    /// Create a broadcast with the given per-subscriber capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Receiver<TraceEvent> {
        let (tx, rx) = bounded(self.capacity);
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }

    /// Publish an event to every live subscriber
    pub fn publish(&self, event: &TraceEvent) {
        let Ok(mut senders) = self.senders.lock() else {
            return;
        };
        senders.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Messages dropped due to slow subscribers
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Snapshot of collector counters
#[derive(Debug, Clone)]
pub struct CollectorStats {
    /// Ring buffer counters
    pub buffer: BufferStats,
    /// Processor counters
    pub processor: ProcessorStats,
    /// Registered sessions
    pub session_count: usize,
    /// Broadcast messages dropped on slow subscribers
    pub broadcast_dropped: u64,
}

/// Session/trace/span lifecycle plus synchronous event emission
pub struct TraceCollector {
    buffer: Arc<TraceRingBuffer>,
    storage: Arc<dyn StorageAdapter>,
    processor: ProcessorHandle,
    broadcast: Arc<EventBroadcast>,
    sessions: RwLock<HashMap<String, SessionInfo>>,
    spans: Mutex<HashMap<String, Span>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    flush_timeout: Duration,
}

impl TraceCollector {
    /// Create a collector with default configuration
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self::with_parts(
            storage,
            CollectorConfig::default(),
            Arc::new(SystemClock),
            Arc::new(UuidV7Source),
        )
    }

    /// Create a collector with explicit configuration
    pub fn with_config(storage: Arc<dyn StorageAdapter>, config: CollectorConfig) -> Self {
        Self::with_parts(storage, config, Arc::new(SystemClock), Arc::new(UuidV7Source))
    }

    /// Create a collector with injected clock and identifier source
    pub fn with_parts(
        storage: Arc<dyn StorageAdapter>,
        config: CollectorConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        let buffer = Arc::new(TraceRingBuffer::new(config.buffer_capacity));
        let broadcast = Arc::new(EventBroadcast::new(config.broadcast_capacity));

        let processor = TraceProcessor::new(buffer.clone(), storage.clone(), config.processor)
            .with_id_source(ids.clone())
            .with_broadcast(broadcast.clone())
            .start();

        Self {
            buffer,
            storage,
            processor,
            broadcast,
            sessions: RwLock::new(HashMap::new()),
            spans: Mutex::new(HashMap::new()),
            clock,
            ids,
            flush_timeout: config.flush_timeout,
        }
    }

    // ---- sessions -------------------------------------------------------

    /// Register and activate a session, emitting `session.started`
    pub fn start_session(
        &self,
        session_id: &str,
        agent_id: &str,
        goal: Option<&str>,
    ) -> Result<SessionInfo> {
        {
            let sessions = self.sessions.read().map_err(|_| poisoned())?;
            if sessions.contains_key(session_id) {
                return Err(WardenError::invalid_request(
                    "requester.session_id",
                    "session already exists",
                ));
            }
        }

        let mut info = SessionInfo::new(
            session_id,
            agent_id,
            self.ids.next_id(),
            self.clock.now(),
        );
        if let Some(goal) = goal {
            info.goal = Some(goal.to_string());
        }
        info.activate();

        self.storage.save_session(&info)?;
        {
            let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
            sessions.insert(session_id.to_string(), info.clone());
        }

        self.record(
            EventType::new(event_names::SESSION_STARTED),
            json!({"agent_id": agent_id, "goal": goal}),
            RecordOptions::session(session_id),
        )?;
        Ok(info)
    }

    /// Register the session if it is unknown; used by the resolver so a
    /// request's session id is always traceable
    pub fn ensure_session(&self, session_id: &str, agent_id: &str) -> Result<SessionInfo> {
        {
            let sessions = self.sessions.read().map_err(|_| poisoned())?;
            if let Some(info) = sessions.get(session_id) {
                if !info.is_active() {
                    return Err(WardenError::SessionEnded {
                        session_id: session_id.to_string(),
                    });
                }
                return Ok(info.clone());
            }
        }
        self.start_session(session_id, agent_id, None)
    }

    /// End a session: emits `session.ended`, rejects further emissions,
    /// and drains the processor
    pub fn end_session(&self, session_id: &str) -> Result<SessionInfo> {
        let now = self.clock.now();
        let info = {
            let sessions = self.sessions.read().map_err(|_| poisoned())?;
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| WardenError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?
        };
        if info.state == SessionState::Ended {
            return Err(WardenError::SessionEnded {
                session_id: session_id.to_string(),
            });
        }

        // Emit while the session still accepts events
        self.record(
            EventType::new(event_names::SESSION_ENDED),
            json!({
                "duration_ms": info.duration_ms(now),
                "resolution_count": info.resolution_count,
                "action_count": info.action_count,
            }),
            RecordOptions::session(session_id),
        )?;

        let updated = {
            let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| WardenError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
            session.end(now);
            session.clone()
        };

        self.storage.update_session(
            session_id,
            &SessionPatch {
                state: Some(SessionState::Ended),
                ended_at: Some(now),
                resolution_count: Some(updated.resolution_count),
                action_count: Some(updated.action_count),
            },
        )?;

        self.flush();
        Ok(updated)
    }

    /// Look up a registered session
    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .read()
            .ok()
            .and_then(|s| s.get(session_id).cloned())
    }

    /// Bump a session's resolution counter
    pub fn note_resolution(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(session) = sessions.get_mut(session_id) {
                session.resolution_count += 1;
            }
        }
    }

    /// Bump a session's action counter
    pub fn note_action(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(session) = sessions.get_mut(session_id) {
                session.action_count += 1;
            }
        }
    }

    // ---- emission -------------------------------------------------------

    /// Record an event; returns immediately, dropping on buffer overflow
    pub fn record(
        &self,
        event_type: EventType,
        payload: Value,
        opts: RecordOptions,
    ) -> Result<RecordAck> {
        let trace_id = {
            let sessions = self.sessions.read().map_err(|_| poisoned())?;
            let session =
                sessions
                    .get(&opts.session_id)
                    .ok_or_else(|| WardenError::SessionNotFound {
                        session_id: opts.session_id.clone(),
                    })?;
            if !session.is_active() {
                return Err(WardenError::SessionEnded {
                    session_id: opts.session_id.clone(),
                });
            }
            opts.trace_id.unwrap_or_else(|| session.trace_id.clone())
        };

        let span_id = opts.span_id.unwrap_or_else(|| self.ids.next_id());
        let mut raw = RawEvent::new(
            opts.session_id,
            trace_id,
            span_id,
            event_type,
            payload,
            self.clock.now(),
        )
        .with_severity(opts.severity);
        raw.parent_span_id = opts.parent_span_id;

        let accepted = self.buffer.push(raw);
        Ok(RecordAck { accepted })
    }

    // ---- spans ----------------------------------------------------------

    /// Open a span and record `<name>.started`
    pub fn start_span(&self, name: &str, opts: SpanOptions) -> Result<Span> {
        let span_id = self.ids.next_id();
        let trace_id = opts.trace_id.clone().unwrap_or_else(|| {
            self.session(&opts.session_id)
                .map(|s| s.trace_id)
                .unwrap_or_else(|| self.ids.next_id())
        });

        let mut span = Span::start(span_id.clone(), trace_id, name, opts.kind, self.clock.now());
        span.parent_span_id = opts.parent_span_id.clone();
        span.attributes = opts.attributes.clone();

        {
            let mut spans = self.spans.lock().map_err(|_| poisoned())?;
            spans.insert(span_id.clone(), span.clone());
        }

        self.record(
            EventType::new(format!("{}.started", name)),
            json!({"span_id": span_id, "name": name}),
            RecordOptions {
                session_id: opts.session_id,
                trace_id: Some(span.trace_id.clone()),
                span_id: Some(span_id),
                parent_span_id: opts.parent_span_id,
                severity: Severity::Debug,
            },
        )?;
        Ok(span)
    }

    /// End a span with a terminal status, recording `<name>.completed` or
    /// `<name>.failed`
    ///
    /// Idempotent: ending an already-terminal span returns the stored span
    /// without emitting anything. Unknown span ids return `None`.
    pub fn end_span(
        &self,
        session_id: &str,
        span_id: &str,
        status: SpanStatus,
        message: Option<&str>,
    ) -> Result<Option<Span>> {
        let now = self.clock.now();
        let (span, transitioned) = {
            let mut spans = self.spans.lock().map_err(|_| poisoned())?;
            match spans.get_mut(span_id) {
                Some(span) => {
                    let transitioned = span.end(status, now);
                    (span.clone(), transitioned)
                }
                None => return Ok(None),
            }
        };

        if !transitioned {
            return Ok(Some(span));
        }

        let (suffix, severity) = match status {
            SpanStatus::Ok => ("completed", Severity::Info),
            SpanStatus::Cancelled => ("failed", Severity::Warn),
            _ => ("failed", Severity::Error),
        };

        let mut payload = json!({
            "span_id": span.span_id,
            "name": span.name,
            "status": status,
            "duration_ms": span.duration_ms(),
        });
        if let (Some(obj), Some(message)) = (payload.as_object_mut(), message) {
            obj.insert("message".to_string(), json!(message));
        }

        self.record(
            EventType::new(format!("{}.{}", span.name, suffix)),
            payload,
            RecordOptions {
                session_id: session_id.to_string(),
                trace_id: Some(span.trace_id.clone()),
                span_id: Some(span.span_id.clone()),
                parent_span_id: span.parent_span_id.clone(),
                severity,
            },
        )?;
        Ok(Some(span))
    }

    /// Look up a span by id
    pub fn span(&self, span_id: &str) -> Option<Span> {
        self.spans.lock().ok().and_then(|s| s.get(span_id).cloned())
    }

    // ---- draining and verification --------------------------------------

    /// Wait for every accepted event to be hashed and chained
    pub fn flush(&self) -> bool {
        self.processor.flush(self.flush_timeout)
    }

    /// Load a session's persisted events in sequence order
    pub fn get_events(&self, session_id: &str) -> Result<Vec<TraceEvent>> {
        self.flush();
        self.storage
            .read_events(&EventFilter::for_session(session_id))
    }

    /// Verify a session's persisted chain
    pub fn verify(&self, session_id: &str) -> Result<ChainVerification> {
        let events = self.get_events(session_id)?;
        Ok(ChainVerifier::verify_chain(&events))
    }

    /// Flush outstanding events and stop the background processor
    pub fn close(&self) {
        self.flush();
        self.processor.shutdown();
    }

    /// Subscribe to processed events; slow subscribers drop, never block
    pub fn subscribe(&self) -> Receiver<TraceEvent> {
        self.broadcast.subscribe()
    }

    /// Snapshot of collector counters
    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            buffer: self.buffer.stats(),
            processor: self.processor.stats(),
            session_count: self.sessions.read().map(|s| s.len()).unwrap_or(0),
            broadcast_dropped: self.broadcast.dropped(),
        }
    }
}

fn poisoned() -> WardenError {
    WardenError::Internal {
        reason: "collector lock poisoned".to_string(),
    }
}
