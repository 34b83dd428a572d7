//! TRACE: hash-chained, replayable audit telemetry
//!
//! TRACE is the append-only event contract of the runtime: every decision
//! and execution emits events that are sequenced, hash-chained per session,
//! and durably appended.
//!
//! ## Key Properties
//!
//! - **Append-Only**: Events can only be added, never modified
//! - **Hash Chain**: Each event carries the hash of its predecessor
//! - **Tamper-Evident**: Any modification breaks chain verification
//! - **Replayable**: A persisted trace can be re-emitted with original timing
//! - **Diffable**: Two traces can be compared structurally
//!
//! ## Architecture
//!
//! The hot path never hashes or touches storage:
//!
//! ```text
//! Hot Path (sync)          Background Worker
//! ────────────────         ─────────────────
//! record() ──────────────► RingBuffer ──────► TraceProcessor
//!   │                        (lock-free)         │
//!   └─ Returns immediately                       ├─ Assigns sequence
//!      Drops on overflow                         ├─ Computes hashes
//!                                                └─ Appends to storage
//! ```

mod buffer;
mod chain;
mod collector;
mod diff;
mod event;
mod processor;
mod raw;
mod replay;
mod span;

pub use buffer::{BufferStats, TraceRingBuffer, DEFAULT_BUFFER_CAPACITY};
pub use chain::{ChainVerification, ChainVerifier};
pub use collector::{
    CollectorConfig, CollectorStats, EventBroadcast, RecordAck, RecordOptions, TraceCollector,
};
pub use diff::{
    Compatibility, DiffKind, DiffOptions, DiffSeverity, TraceDiff, TraceDiffer, TraceDifference,
    DEFAULT_IGNORED_FIELDS,
};
pub use event::{
    event_names, ArtifactRef, ArtifactStorage, EventFilter, EventSource, EventType, Severity,
    TraceEvent, INLINE_ARTIFACT_LIMIT,
};
pub use processor::{ProcessorConfig, ProcessorHandle, ProcessorStats, TraceProcessor};
pub use raw::RawEvent;
pub use replay::{ReplayEvent, ReplayMode, ReplayOptions, ReplaySession};
pub use span::{Span, SpanKind, SpanLink, SpanOptions, SpanStatus};

/// TRACE protocol version
pub const VERSION: &str = "1.0";

/// `previous_event_hash` of a session's genesis event
pub const GENESIS_HASH: &str = "";
