//! Hash chain verification
//!
//! Recomputes per-event hashes and checks chain linkage and sequencing for
//! a session's events. Verification scans the whole chain and reports every
//! problem found rather than stopping at the first.

use serde::{Deserialize, Serialize};

use crate::ident::sha256_hex;

use super::event::{ArtifactRef, TraceEvent};
use super::GENESIS_HASH;

/// Result of verifying a session's hash chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Whether every check passed
    pub ok: bool,

    /// Number of events examined
    pub event_count: usize,

    /// One entry per failed check, formatted `Event i (id): reason`
    pub errors: Vec<String>,

    /// Hash of the last event, when the chain is intact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_hash: Option<String>,
}

impl ChainVerification {
    /// Verification of an empty chain (trivially valid)
    pub fn empty() -> Self {
        Self {
            ok: true,
            event_count: 0,
            errors: vec![],
            last_hash: None,
        }
    }
}

/// Verifier for event chains and artifacts
pub struct ChainVerifier;

impl ChainVerifier {
    /// Verify a full chain
    ///
    /// Checks, per event: the sequence is `i + 1` (1-based, gap-free), the
    /// genesis event's `previous_event_hash` is empty, every later event
    /// links to its predecessor's `event_hash`, and the stored `event_hash`
    /// matches a recomputation over the canonical form.
    pub fn verify_chain(events: &[TraceEvent]) -> ChainVerification {
        if events.is_empty() {
            return ChainVerification::empty();
        }

        let mut errors = Vec::new();

        for (i, event) in events.iter().enumerate() {
            let expected_sequence = (i as u64) + 1;
            if event.sequence != expected_sequence {
                errors.push(format!(
                    "Event {} ({}): sequence {} does not match expected {}",
                    i, event.event_id, event.sequence, expected_sequence
                ));
            }

            if i == 0 {
                if event.previous_event_hash != GENESIS_HASH {
                    errors.push(format!(
                        "Event {} ({}): genesis previous_event_hash must be empty, got {}",
                        i, event.event_id, event.previous_event_hash
                    ));
                }
            } else {
                let previous = &events[i - 1];
                if event.previous_event_hash != previous.event_hash {
                    errors.push(format!(
                        "Event {} ({}): previous_event_hash {} does not link to predecessor hash {}",
                        i, event.event_id, event.previous_event_hash, previous.event_hash
                    ));
                }
            }

            if !event.verify_hash() {
                errors.push(format!(
                    "Event {} ({}): stored hash {} does not match recomputed {}",
                    i,
                    event.event_id,
                    event.event_hash,
                    event.compute_hash()
                ));
            }
        }

        let ok = errors.is_empty();
        ChainVerification {
            ok,
            event_count: events.len(),
            errors,
            last_hash: if ok {
                events.last().map(|e| e.event_hash.clone())
            } else {
                None
            },
        }
    }

    /// Verify a single event's stored hash
    pub fn verify_event(event: &TraceEvent) -> bool {
        event.verify_hash()
    }

    /// Verify that `content` matches an artifact reference's hash and size
    pub fn verify_artifact(artifact: &ArtifactRef, content: &[u8]) -> bool {
        artifact.size_bytes == content.len() as u64
            && artifact.content_hash == sha256_hex(content)
    }

    /// Whether `extension` continues `base` (linkage and sequencing)
    pub fn verify_extension(base: &[TraceEvent], extension: &[TraceEvent]) -> bool {
        let (Some(last), Some(first)) = (base.last(), extension.first()) else {
            return false;
        };
        first.previous_event_hash == last.event_hash && first.sequence == last.sequence + 1
    }

    /// Index of the first event at which two chains differ, if any
    pub fn find_divergence(a: &[TraceEvent], b: &[TraceEvent]) -> Option<usize> {
        let common = a.len().min(b.len());
        for i in 0..common {
            if a[i].event_hash != b[i].event_hash {
                return Some(i);
            }
        }
        if a.len() != b.len() {
            Some(common)
        } else {
            None
        }
    }
}
