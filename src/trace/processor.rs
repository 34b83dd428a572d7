//! Background trace processor
//!
//! The processor is the single consumer of the ring buffer. It assigns
//! per-session sequence numbers, links and hashes events, and appends them
//! to the storage adapter. It is the sole mutator of chain state, so the
//! hot path never contends on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::ident::{IdSource, UuidV7Source};
use crate::storage::StorageAdapter;

use super::buffer::TraceRingBuffer;
use super::collector::EventBroadcast;
use super::event::{EventSource, TraceEvent};
use super::raw::RawEvent;
use super::{GENESIS_HASH, VERSION};

/// Processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum events processed per drain
    pub batch_size: usize,

    /// Sleep when the buffer is empty
    pub poll_interval: Duration,

    /// Storage append attempts before a batch is parked
    pub max_append_retries: u32,

    /// Backoff between append attempts (scaled linearly per attempt)
    pub retry_backoff: Duration,

    /// Drain remaining events when shutting down
    pub flush_on_shutdown: bool,

    /// Source stamped onto processed events
    pub source: EventSource,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(10),
            max_append_retries: 3,
            retry_backoff: Duration::from_millis(50),
            flush_on_shutdown: true,
            source: EventSource::default(),
        }
    }
}

impl ProcessorConfig {
    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the empty-buffer poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set retry bounds for storage appends
    pub fn with_append_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.max_append_retries = retries;
        self.retry_backoff = backoff;
        self
    }
}

/// Per-session chain state; `sequence` is the last assigned number
#[derive(Debug, Clone)]
struct ChainState {
    sequence: u64,
    last_hash: String,
}

impl ChainState {
    fn new() -> Self {
        Self {
            sequence: 0,
            last_hash: GENESIS_HASH.to_string(),
        }
    }
}

enum Control {
    ResetSession(String),
}

#[derive(Debug, Default)]
struct SharedCounters {
    processed: AtomicU64,
    append_failures: AtomicU64,
    parked_events: AtomicU64,
}

/// Snapshot of processor counters
#[derive(Debug, Clone, Copy)]
pub struct ProcessorStats {
    /// Raw events hashed and chained
    pub processed: u64,
    /// Append attempts that exhausted their retries
    pub append_failures: u64,
    /// Events currently parked in memory awaiting storage
    pub parked_events: u64,
}

/// Background worker that hashes, chains, and persists raw events
pub struct TraceProcessor {
    buffer: Arc<TraceRingBuffer>,
    storage: Arc<dyn StorageAdapter>,
    ids: Arc<dyn IdSource>,
    broadcast: Option<Arc<EventBroadcast>>,
    config: ProcessorConfig,
}

impl TraceProcessor {
    /// Create a processor
    pub fn new(
        buffer: Arc<TraceRingBuffer>,
        storage: Arc<dyn StorageAdapter>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            buffer,
            storage,
            ids: Arc::new(UuidV7Source),
            broadcast: None,
            config,
        }
    }

    /// Use a specific identifier source (tests pin event ids through this)
    pub fn with_id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Publish processed events to a broadcast fan-out
    pub fn with_broadcast(mut self, broadcast: Arc<EventBroadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// Start the worker thread
    pub fn start(self) -> ProcessorHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(SharedCounters::default());
        let (control_tx, control_rx) = unbounded();

        let worker = Worker {
            buffer: self.buffer.clone(),
            storage: self.storage,
            ids: self.ids,
            broadcast: self.broadcast,
            config: self.config,
            shutdown: shutdown.clone(),
            counters: counters.clone(),
            control: control_rx,
            chains: HashMap::new(),
            parked: Vec::new(),
        };

        let handle = thread::spawn(move || worker.run());

        ProcessorHandle {
            shutdown,
            control: control_tx,
            counters,
            buffer: self.buffer,
            handle: Some(handle),
        }
    }
}

struct Worker {
    buffer: Arc<TraceRingBuffer>,
    storage: Arc<dyn StorageAdapter>,
    ids: Arc<dyn IdSource>,
    broadcast: Option<Arc<EventBroadcast>>,
    config: ProcessorConfig,
    shutdown: Arc<AtomicBool>,
    counters: Arc<SharedCounters>,
    control: Receiver<Control>,
    chains: HashMap<String, ChainState>,
    parked: Vec<Vec<TraceEvent>>,
}

impl Worker {
    fn run(mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.handle_control();
            self.retry_parked();

            let batch = self.buffer.drain(self.config.batch_size);
            if batch.is_empty() {
                thread::sleep(self.config.poll_interval);
                continue;
            }
            self.process_batch(batch);
        }

        if self.config.flush_on_shutdown {
            self.handle_control();
            let remaining = self.buffer.drain_all();
            if !remaining.is_empty() {
                self.process_batch(remaining);
            }
            self.retry_parked();
        }
    }

    fn handle_control(&mut self) {
        while let Ok(message) = self.control.try_recv() {
            match message {
                Control::ResetSession(session_id) => {
                    self.chains.remove(&session_id);
                }
            }
        }
    }

    fn process_batch(&mut self, batch: Vec<RawEvent>) {
        let mut events = Vec::with_capacity(batch.len());
        for raw in batch {
            events.push(self.chain_event(raw));
        }
        self.counters
            .processed
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        if let Some(broadcast) = &self.broadcast {
            for event in &events {
                broadcast.publish(event);
            }
        }

        if !self.append_with_retry(&events) {
            self.counters.append_failures.fetch_add(1, Ordering::Relaxed);
            self.counters
                .parked_events
                .fetch_add(events.len() as u64, Ordering::Relaxed);
            tracing::warn!(
                batch = events.len(),
                "storage append exhausted retries, parking batch"
            );
            self.parked.push(events);
        }
    }

    /// Assign sequence, link to the chain, and hash one raw event
    fn chain_event(&mut self, raw: RawEvent) -> TraceEvent {
        let state = self
            .chains
            .entry(raw.session_id.clone())
            .or_insert_with(ChainState::new);

        let sequence = state.sequence + 1;
        let previous_event_hash = state.last_hash.clone();

        let mut event = TraceEvent {
            trace_version: VERSION.to_string(),
            event_id: self.ids.next_id(),
            session_id: raw.session_id,
            trace_id: raw.trace_id,
            span_id: raw.span_id,
            parent_span_id: raw.parent_span_id,
            event_type: raw.event_type,
            severity: raw.severity,
            sequence,
            timestamp: raw.timestamp,
            payload: raw.payload,
            artifacts: vec![],
            source: self.config.source.clone(),
            previous_event_hash,
            event_hash: String::new(),
        };
        event.event_hash = event.compute_hash();

        state.sequence = sequence;
        state.last_hash = event.event_hash.clone();
        event
    }

    fn append_with_retry(&self, events: &[TraceEvent]) -> bool {
        for attempt in 0..=self.config.max_append_retries {
            match self.storage.append_events(events) {
                Ok(()) => return true,
                Err(error) => {
                    tracing::debug!(attempt, %error, "storage append failed");
                    if attempt < self.config.max_append_retries {
                        thread::sleep(self.config.retry_backoff * (attempt + 1));
                    }
                }
            }
        }
        false
    }

    fn retry_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        let batch = self.parked.remove(0);
        if self.storage.append_events(&batch).is_ok() {
            self.counters
                .parked_events
                .fetch_sub(batch.len() as u64, Ordering::Relaxed);
            tracing::debug!(batch = batch.len(), "parked batch flushed to storage");
        } else {
            self.parked.insert(0, batch);
        }
    }
}

/// Handle to a running processor
pub struct ProcessorHandle {
    shutdown: Arc<AtomicBool>,
    control: Sender<Control>,
    counters: Arc<SharedCounters>,
    buffer: Arc<TraceRingBuffer>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Signal cooperative shutdown
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Signal shutdown and wait for the worker to drain and exit
    pub fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Whether the worker has been told to stop
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    /// Drop chain state for a session (next event starts a new genesis)
    pub fn reset_session(&self, session_id: &str) {
        let _ = self
            .control
            .send(Control::ResetSession(session_id.to_string()));
    }

    /// Wait until every accepted event has been hashed and chained
    ///
    /// Returns `false` on timeout. Parked batches count as processed; only
    /// sequencing and hashing are awaited, not storage durability.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let accepted = self.buffer.total_pushed();
            let processed = self.counters.processed.load(Ordering::Relaxed);
            if self.buffer.is_empty() && processed >= accepted {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Snapshot of processor counters
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            append_failures: self.counters.append_failures.load(Ordering::Relaxed),
            parked_events: self.counters.parked_events.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, WardenError};
    use crate::storage::InMemoryStorage;
    use crate::trace::chain::ChainVerifier;
    use crate::trace::event::{EventFilter, EventType};
    use chrono::Utc;
    use serde_json::json;

    fn raw(session: &str, n: usize) -> RawEvent {
        RawEvent::new(
            session,
            format!("trace-{}", session),
            "span-1",
            EventType::new("carp.request.received"),
            json!({"n": n}),
            Utc::now(),
        )
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig::default()
            .with_poll_interval(Duration::from_millis(1))
            .with_append_retries(1, Duration::from_millis(1))
    }

    #[test]
    fn test_sequences_start_at_one_and_chain() {
        let buffer = Arc::new(TraceRingBuffer::new(64));
        let storage = Arc::new(InMemoryStorage::new());

        for n in 0..5 {
            buffer.push(raw("s1", n));
        }

        let handle =
            TraceProcessor::new(buffer.clone(), storage.clone(), fast_config()).start();
        assert!(handle.flush(Duration::from_secs(2)));
        handle.join();

        let events = storage
            .read_events(&EventFilter::for_session("s1"))
            .unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[0].previous_event_hash, "");
        for i in 1..events.len() {
            assert_eq!(events[i].sequence, (i as u64) + 1);
            assert_eq!(events[i].previous_event_hash, events[i - 1].event_hash);
        }
        assert!(ChainVerifier::verify_chain(&events).ok);
    }

    #[test]
    fn test_chains_are_per_session() {
        let buffer = Arc::new(TraceRingBuffer::new(64));
        let storage = Arc::new(InMemoryStorage::new());

        buffer.push(raw("s1", 0));
        buffer.push(raw("s2", 0));
        buffer.push(raw("s1", 1));

        let handle =
            TraceProcessor::new(buffer.clone(), storage.clone(), fast_config()).start();
        assert!(handle.flush(Duration::from_secs(2)));
        handle.join();

        for session in ["s1", "s2"] {
            let events = storage
                .read_events(&EventFilter::for_session(session))
                .unwrap();
            assert_eq!(events[0].sequence, 1);
            assert_eq!(events[0].previous_event_hash, "");
            assert!(ChainVerifier::verify_chain(&events).ok);
        }
    }

    #[test]
    fn test_shutdown_drains_remaining() {
        let buffer = Arc::new(TraceRingBuffer::new(64));
        let storage = Arc::new(InMemoryStorage::new());

        let handle =
            TraceProcessor::new(buffer.clone(), storage.clone(), fast_config()).start();

        for n in 0..10 {
            buffer.push(raw("s1", n));
        }
        handle.join();

        let events = storage
            .read_events(&EventFilter::for_session("s1"))
            .unwrap();
        assert_eq!(events.len(), 10);
    }

    #[test]
    fn test_reset_session_restarts_chain() {
        let buffer = Arc::new(TraceRingBuffer::new(64));
        let storage = Arc::new(InMemoryStorage::new());

        let handle =
            TraceProcessor::new(buffer.clone(), storage.clone(), fast_config()).start();

        buffer.push(raw("s1", 0));
        assert!(handle.flush(Duration::from_secs(2)));

        handle.reset_session("s1");
        buffer.push(raw("s1", 1));
        assert!(handle.flush(Duration::from_secs(2)));
        handle.join();

        let events = storage
            .read_events(&EventFilter::for_session("s1"))
            .unwrap();
        assert_eq!(events.len(), 2);
        // Both events are geneses of their own chain segments
        assert_eq!(events[1].sequence, 1);
        assert_eq!(events[1].previous_event_hash, "");
    }

    /// Storage that fails a configurable number of appends
    struct FlakyStorage {
        inner: InMemoryStorage,
        failures_left: std::sync::atomic::AtomicU32,
    }

    impl StorageAdapter for FlakyStorage {
        fn append_events(&self, events: &[TraceEvent]) -> Result<()> {
            if self.failures_left.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok()
            {
                return Err(WardenError::Storage {
                    reason: "simulated outage".to_string(),
                });
            }
            self.inner.append_events(events)
        }

        fn read_events(&self, filter: &EventFilter) -> Result<Vec<TraceEvent>> {
            self.inner.read_events(filter)
        }

        fn save_resolution(&self, resolution: &crate::carp::Resolution) -> Result<()> {
            self.inner.save_resolution(resolution)
        }

        fn get_resolution(&self, id: &str) -> Result<Option<crate::carp::Resolution>> {
            self.inner.get_resolution(id)
        }

        fn delete_resolution(&self, id: &str) -> Result<()> {
            self.inner.delete_resolution(id)
        }

        fn save_session(&self, info: &crate::session::SessionInfo) -> Result<()> {
            self.inner.save_session(info)
        }

        fn update_session(
            &self,
            id: &str,
            patch: &crate::session::SessionPatch,
        ) -> Result<()> {
            self.inner.update_session(id, patch)
        }

        fn list_sessions(
            &self,
            filter: &crate::session::SessionFilter,
        ) -> Result<Vec<crate::session::SessionInfo>> {
            self.inner.list_sessions(filter)
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_parked_batch_recovers_after_outage() {
        let buffer = Arc::new(TraceRingBuffer::new(64));
        // Fail more appends than the retry budget so the batch parks
        let storage = Arc::new(FlakyStorage {
            inner: InMemoryStorage::new(),
            failures_left: std::sync::atomic::AtomicU32::new(3),
        });

        buffer.push(raw("s1", 0));

        let handle =
            TraceProcessor::new(buffer.clone(), storage.clone(), fast_config()).start();
        assert!(handle.flush(Duration::from_secs(2)));

        // Push another event so the loop keeps turning and retries the park
        buffer.push(raw("s1", 1));
        assert!(handle.flush(Duration::from_secs(2)));
        handle.join();

        let events = storage
            .inner
            .read_events(&EventFilter::for_session("s1"))
            .unwrap();
        assert_eq!(events.len(), 2, "parked batch must eventually land");
        assert!(ChainVerifier::verify_chain(&events).ok);
    }
}
