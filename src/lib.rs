//! # Warden Core: authority runtime for AI agents
//!
//! Warden decides, deterministically, what an agent may read and do for a
//! stated goal, and proves what actually happened:
//!
//! - **CARP** (Context & Action Resolution Protocol): resolves a goal into
//!   context blocks, action permissions, and a tagged decision, bounded by
//!   TTLs
//! - **TRACE**: an append-only, hash-chained audit log of every decision
//!   and execution, replayable and diffable
//! - **Atlas**: versioned packages of context packs, actions, and policy
//!   rules, bound to domains
//!
//! ## Core Principle
//!
//! > If it wasn't emitted by the runtime, it didn't happen.
//!
//! The runtime is authoritative, not the model. Decisions are advisory to
//! downstream enforcers; the hash chain makes tampering evident.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use warden_core::atlas::{AtlasLoader, AtlasManifest, AtlasStore};
//! use warden_core::carp::{CarpRequest, Decision, Resolver};
//! use warden_core::storage::InMemoryStorage;
//! use warden_core::trace::TraceCollector;
//!
//! let manifest: AtlasManifest = serde_json::from_value(serde_json::json!({
//!     "atlas_version": "0.1",
//!     "metadata": {"id": "hello-world", "version": "0.1.0", "name": "Hello World"},
//!     "domains": [{"id": "demo.greeting"}],
//!     "context_packs": [
//!         {"id": "overview", "domain": "demo.greeting", "source": "overview.md", "priority": 100}
//!     ],
//!     "actions": [
//!         {"id": "greeting.send", "action_type": "greeting.send",
//!          "domain": "demo.greeting", "name": "Send Greeting", "risk_tier": "low"}
//!     ]
//! })).unwrap();
//!
//! let mut packs = HashMap::new();
//! packs.insert("overview".to_string(), "# Greetings\n\nSay hello.".to_string());
//! let atlas = AtlasLoader::new().load_from_manifest(manifest, packs).unwrap();
//!
//! let store = Arc::new(AtlasStore::new());
//! store.insert(atlas);
//!
//! let storage = Arc::new(InMemoryStorage::new());
//! let collector = Arc::new(TraceCollector::new(storage.clone()));
//! let resolver = Resolver::new(store, collector.clone(), storage);
//!
//! let request = CarpRequest::resolve("agent-1", "session-1", "Send a greeting");
//! let resolution = resolver.resolve(&request).unwrap();
//! assert!(matches!(resolution.decision, Decision::Allow));
//! assert!(resolution.is_action_allowed("greeting.send"));
//!
//! // The session's audit chain verifies end to end
//! assert!(collector.verify("session-1").unwrap().ok);
//! ```

pub mod atlas;
pub mod carp;
pub mod error;
pub mod ident;
pub mod session;
pub mod storage;
pub mod timing;
pub mod trace;

pub use carp::{
    ActionPermission, CancellationToken, CarpRequest, Constraint, ContextBlock, Decision,
    DeniedAction, ExecutionResult, Operation, Resolution, ResolutionCache, Resolver,
    ResolverConfig, RiskTier, TaskSpec,
};
pub use error::{ErrorResponse, FieldDiagnostic, Result, WardenError};
pub use session::{SessionFilter, SessionInfo, SessionPatch, SessionState};
pub use storage::{FileStorage, InMemoryStorage, StorageAdapter};
pub use trace::{
    ChainVerification, ChainVerifier, EventFilter, EventType, RawEvent, ReplaySession, Severity,
    TraceCollector, TraceDiff, TraceDiffer, TraceEvent,
};

/// CARP protocol version
pub const CARP_VERSION: &str = carp::VERSION;

/// TRACE protocol version
pub const TRACE_VERSION: &str = trace::VERSION;

/// Atlas manifest format version
pub const ATLAS_VERSION: &str = atlas::VERSION;
