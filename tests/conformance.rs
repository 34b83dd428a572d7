//! Conformance checks: determinism, ordering, integrity, and boundary
//! behaviors of the resolution and audit contracts

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use warden_core::atlas::{
    estimate_tokens, AtlasLoader, AtlasManifest, AtlasStore, AtlasStoreConfig, ContextQuery,
    PolicyContext,
};
use warden_core::carp::{CarpRequest, Decision, RequestScope, Resolver, RiskTier, TaskSpec};
use warden_core::ident::{canonical_json, SequentialIdSource};
use warden_core::storage::InMemoryStorage;
use warden_core::timing::{Clock, FixedClock};
use warden_core::trace::{
    ChainVerifier, CollectorConfig, EventType, ProcessorConfig, RecordOptions, TraceCollector,
};

fn instant(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn collector_with_storage() -> (Arc<TraceCollector>, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let collector = Arc::new(TraceCollector::with_config(
        storage.clone(),
        CollectorConfig::default().with_processor(
            ProcessorConfig::default().with_poll_interval(Duration::from_millis(1)),
        ),
    ));
    (collector, storage)
}

fn load_atlas(store: &AtlasStore, manifest: serde_json::Value, packs: Vec<(&str, String)>) {
    let manifest: AtlasManifest = serde_json::from_value(manifest).unwrap();
    let content: HashMap<String, String> = packs
        .into_iter()
        .map(|(id, text)| (id.to_string(), text))
        .collect();
    let atlas = AtlasLoader::new()
        .load_from_manifest(manifest, content)
        .unwrap();
    store.insert(atlas);
}

fn library_atlas() -> serde_json::Value {
    json!({
        "atlas_version": "0.1",
        "metadata": {"id": "library", "version": "2.0.0", "name": "Library"},
        "domains": [{"id": "docs"}],
        "context_packs": [
            {"id": "alpha", "domain": "docs", "source": "alpha.md", "priority": 10},
            {"id": "beta", "domain": "docs", "source": "beta.md", "priority": 50},
            {"id": "gamma", "domain": "docs", "source": "gamma.md", "priority": 50},
            {"id": "delta", "domain": "docs", "source": "delta.md", "priority": 90}
        ],
        "actions": [
            {"id": "docs.read", "action_type": "docs.read", "domain": "docs", "name": "Read", "risk_tier": "low"}
        ]
    })
}

fn library_packs() -> Vec<(&'static str, String)> {
    vec![
        ("alpha", "a".repeat(40)),
        ("beta", "b".repeat(40)),
        ("gamma", "c".repeat(40)),
        ("delta", "d".repeat(40)),
    ]
}

#[test]
fn context_selection_is_priority_ordered_and_budget_bounded() {
    let store = AtlasStore::new();
    load_atlas(&store, library_atlas(), library_packs());
    let atlas = store.get("library").unwrap();

    for max_tokens in [0u64, 10, 20, 25, 40, 1000] {
        let blocks = store.get_context_blocks(
            &atlas,
            &ContextQuery {
                domains: vec!["docs".to_string()],
                tags: vec![],
                max_tokens,
            },
        );

        let total: u64 = blocks.iter().map(|b| b.token_count).sum();
        assert!(total <= max_tokens, "budget {} exceeded: {}", max_tokens, total);

        // Priority descending, pack id ascending on ties
        for pair in blocks.windows(2) {
            assert!(
                pair[0].priority > pair[1].priority
                    || (pair[0].priority == pair[1].priority
                        && pair[0].pack_ref < pair[1].pack_ref)
            );
        }
    }

    // Full selection order: delta(90), beta(50), gamma(50), alpha(10)
    let blocks = store.get_context_blocks(
        &atlas,
        &ContextQuery {
            domains: vec![],
            tags: vec![],
            max_tokens: 1000,
        },
    );
    let order: Vec<&str> = blocks.iter().map(|b| b.pack_ref.as_str()).collect();
    assert_eq!(order, vec!["delta", "beta", "gamma", "alpha"]);
}

#[test]
fn policy_evaluation_is_order_stable() {
    let rule = |id: &str, tier: &str, priority: i64| {
        json!({
            "id": id,
            "condition": {"field": "risk_tier", "op": "in", "value": ["high", "critical"]},
            "effect": if tier == "deny" { "deny" } else { "require_approval" },
            "priority": priority
        })
    };

    let manifest_with = |rules: Vec<serde_json::Value>| {
        json!({
            "atlas_version": "0.1",
            "metadata": {"id": "policies", "version": "1.0.0", "name": "Policies"},
            "domains": [{"id": "d"}],
            "policies": [{"id": "p", "rules": rules}],
            "actions": []
        })
    };

    let matched_ids = |manifest: serde_json::Value| -> Vec<String> {
        let store = AtlasStore::new();
        load_atlas(&store, manifest, vec![]);
        let atlas = store.get("policies").unwrap();
        let outcome = store.evaluate_policies(
            &atlas,
            &PolicyContext::for_request(Some(RiskTier::High), "a", "s", instant(0)),
        );
        outcome
            .matched_rules
            .iter()
            .map(|m| m.rule_id.clone())
            .collect()
    };

    // Distinct priorities: declaration order is irrelevant
    let forward = matched_ids(manifest_with(vec![
        rule("first", "deny", 100),
        rule("second", "approve", 50),
    ]));
    let reversed = matched_ids(manifest_with(vec![
        rule("second", "approve", 50),
        rule("first", "deny", 100),
    ]));
    assert_eq!(forward, reversed);
    assert_eq!(forward, vec!["first", "second"]);

    // Equal priorities: declaration order is preserved
    let declared = matched_ids(manifest_with(vec![
        rule("one", "approve", 10),
        rule("two", "approve", 10),
    ]));
    assert_eq!(declared, vec!["one", "two"]);
    let redeclared = matched_ids(manifest_with(vec![
        rule("two", "approve", 10),
        rule("one", "approve", 10),
    ]));
    assert_eq!(redeclared, vec!["two", "one"]);
}

#[test]
fn trace_integrity_laws() {
    let (collector, _storage) = collector_with_storage();
    collector
        .start_session("session-1", "agent-1", None)
        .unwrap();

    for n in 0..10 {
        collector
            .record(
                EventType::new("carp.request.received"),
                json!({"n": n}),
                RecordOptions::session("session-1"),
            )
            .unwrap();
    }

    let events = collector.get_events("session-1").unwrap();
    assert_eq!(events.len(), 11); // session.started + 10

    // sequence(e_i) = i, starting at 1, gap-free
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, (i as u64) + 1);
    }
    // Genesis has an empty previous hash; every later event links back
    assert_eq!(events[0].previous_event_hash, "");
    for i in 1..events.len() {
        assert_eq!(events[i].previous_event_hash, events[i - 1].event_hash);
    }
    assert!(ChainVerifier::verify_chain(&events).ok);
}

#[test]
fn tampering_any_field_breaks_verification() {
    let (collector, _storage) = collector_with_storage();
    collector
        .start_session("session-1", "agent-1", None)
        .unwrap();
    for n in 0..5 {
        collector
            .record(
                EventType::new("carp.request.received"),
                json!({"n": n}),
                RecordOptions::session("session-1"),
            )
            .unwrap();
    }
    let pristine = collector.get_events("session-1").unwrap();
    assert!(ChainVerifier::verify_chain(&pristine).ok);

    // Payload tampering
    let mut tampered = pristine.clone();
    tampered[2].payload = json!({"n": 999});
    assert!(!ChainVerifier::verify_chain(&tampered).ok);

    // Metadata tampering
    let mut tampered = pristine.clone();
    tampered[3].span_id = "forged".to_string();
    assert!(!ChainVerifier::verify_chain(&tampered).ok);

    // Severity tampering
    let mut tampered = pristine.clone();
    tampered[1].severity = warden_core::Severity::Error;
    assert!(!ChainVerifier::verify_chain(&tampered).ok);

    // Reordering
    let mut tampered = pristine.clone();
    tampered.swap(1, 2);
    assert!(!ChainVerifier::verify_chain(&tampered).ok);

    // Truncating the head
    let tampered: Vec<_> = pristine[1..].to_vec();
    assert!(!ChainVerifier::verify_chain(&tampered).ok);
}

#[test]
fn canonicalization_is_a_fixed_point() {
    let (collector, _storage) = collector_with_storage();
    collector
        .start_session("session-1", "agent-1", None)
        .unwrap();
    collector
        .record(
            EventType::new("carp.request.received"),
            json!({"zeta": 1, "alpha": {"b": [1, 2.5, null], "a": "x\n"}}),
            RecordOptions::session("session-1"),
        )
        .unwrap();

    let events = collector.get_events("session-1").unwrap();
    for event in &events {
        let canonical = event.canonical();
        let reparsed: serde_json::Value = serde_json::from_str(&canonical).unwrap();
        assert_eq!(canonical_json(&reparsed), canonical);
    }
}

#[test]
fn resolution_invariants_hold() {
    let clock = Arc::new(FixedClock::new(instant(0)));
    let ids = Arc::new(SequentialIdSource::new("id"));
    let storage = Arc::new(InMemoryStorage::new());
    let store = Arc::new(AtlasStore::with_parts(
        AtlasStoreConfig::default(),
        clock.clone(),
        ids.clone(),
    ));
    load_atlas(&store, library_atlas(), library_packs());

    let collector = Arc::new(TraceCollector::with_parts(
        storage.clone(),
        CollectorConfig::default().with_processor(
            ProcessorConfig::default().with_poll_interval(Duration::from_millis(1)),
        ),
        clock.clone(),
        ids.clone(),
    ));
    let resolver = Resolver::new(store, collector, storage)
        .with_clock(clock.clone())
        .with_id_source(ids);

    let request = CarpRequest::resolve("agent-1", "session-1", "Read the docs")
        .with_task(TaskSpec::new("Read the docs").with_context_hints(vec!["docs".to_string()]))
        .with_scope(RequestScope {
            max_context_tokens: Some(25),
            ..RequestScope::default()
        });
    let resolution = resolver.resolve(&request).unwrap();

    // request echo and TTL ordering
    assert_eq!(resolution.request_id, request.request_id);
    assert!(resolution.ttl.resolution_expires_at > clock.now());
    assert!(resolution.ttl.context_expires_at <= resolution.ttl.resolution_expires_at);
    assert!(resolution.ttl.refresh_after < resolution.ttl.resolution_expires_at);

    // token budget honored
    assert!(resolution.total_context_tokens() <= 25);

    // action ids unique; permission validity bounded by the resolution
    let mut ids_seen = std::collections::HashSet::new();
    for action in &resolution.allowed_actions {
        assert!(ids_seen.insert(action.action_id.clone()));
        assert!(action.valid_until <= resolution.ttl.resolution_expires_at);
    }
}

#[test]
fn critical_tier_without_deny_gets_audit_constraint() {
    let store = Arc::new(AtlasStore::new());
    load_atlas(&store, library_atlas(), library_packs());
    let (collector, storage) = collector_with_storage();
    let resolver = Resolver::new(store, collector, storage);

    let request = CarpRequest::resolve("agent-1", "session-1", "Careful work").with_task(
        TaskSpec::new("Careful work")
            .with_risk_tier(RiskTier::Critical)
            .with_context_hints(vec!["docs".to_string()]),
    );
    let resolution = resolver.resolve(&request).unwrap();

    match &resolution.decision {
        Decision::AllowWithConstraints { constraints } => {
            let audit = constraints
                .iter()
                .find(|c| c.name == "audit_required")
                .expect("audit_required constraint present");
            assert_eq!(
                audit.severity,
                warden_core::carp::ConstraintSeverity::Hard
            );
        }
        other => panic!("expected AllowWithConstraints, got {:?}", other),
    }
}

#[test]
fn zero_token_budget_still_resolves() {
    let store = Arc::new(AtlasStore::new());
    load_atlas(&store, library_atlas(), library_packs());
    let (collector, storage) = collector_with_storage();
    let resolver = Resolver::new(store, collector.clone(), storage);

    let request = CarpRequest::resolve("agent-1", "session-1", "Read nothing")
        .with_task(TaskSpec::new("Read nothing").with_context_hints(vec!["docs".to_string()]))
        .with_scope(RequestScope {
            max_context_tokens: Some(0),
            ..RequestScope::default()
        });
    let resolution = resolver.resolve(&request).unwrap();

    assert!(resolution.context_blocks.is_empty());
    assert!(matches!(resolution.decision, Decision::Allow));
    assert!(collector.verify("session-1").unwrap().ok);
}

#[test]
fn buffer_overflow_drops_but_chain_survives() {
    let storage = Arc::new(InMemoryStorage::new());
    let collector = Arc::new(TraceCollector::with_config(
        storage.clone(),
        CollectorConfig::default()
            .with_buffer_capacity(4)
            .with_processor(
                ProcessorConfig::default().with_poll_interval(Duration::from_millis(30)),
            ),
    ));
    collector
        .start_session("session-1", "agent-1", None)
        .unwrap();

    let mut dropped = 0u64;
    for n in 0..200 {
        let ack = collector
            .record(
                EventType::new("carp.request.received"),
                json!({"n": n}),
                RecordOptions::session("session-1"),
            )
            .unwrap();
        if ack.dropped() {
            dropped += 1;
        }
    }

    assert!(dropped > 0, "a 4-slot buffer under a burst must drop");
    assert_eq!(collector.stats().buffer.dropped, dropped);

    // Dropped events never entered the chain: storage verifies gap-free
    let verification = collector.verify("session-1").unwrap();
    assert!(verification.ok, "errors: {:?}", verification.errors);
    assert_eq!(
        verification.event_count as u64,
        201 - dropped // session.started + 200 records - drops
    );
}

#[test]
fn cancelled_resolve_emits_event_and_skips_cache() {
    let store = Arc::new(AtlasStore::new());
    load_atlas(&store, library_atlas(), library_packs());
    let (collector, storage) = collector_with_storage();
    let resolver = Resolver::new(store, collector.clone(), storage);

    let request = CarpRequest::resolve("agent-1", "session-1", "Read the docs")
        .with_task(TaskSpec::new("Read the docs").with_context_hints(vec!["docs".to_string()]));

    let token = warden_core::CancellationToken::new();
    token.cancel();
    let result = resolver.resolve_cancellable(&request, &token);
    assert!(matches!(result, Err(warden_core::WardenError::Cancelled)));

    let events = collector.get_events("session-1").unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(names.contains(&"carp.resolution.cancelled"));
    // The wrapping span closed on the cancel path
    assert!(names.contains(&"carp.resolve.failed"));

    // The cancelled attempt populated nothing: a later resolve is a miss
    let resolution = resolver.resolve(&request).unwrap();
    assert_eq!(resolution.request_id, request.request_id);
    let events = collector.get_events("session-1").unwrap();
    assert!(!events
        .iter()
        .any(|e| e.event_type.as_str() == "carp.resolution.cache_hit"));
}

#[test]
fn estimate_tokens_matches_spec() {
    for (bytes, tokens) in [(0u64, 0u64), (1, 1), (3, 1), (4, 1), (5, 2), (157, 40)] {
        assert_eq!(estimate_tokens(bytes as usize), tokens);
    }
}

#[test]
fn end_span_is_idempotent_across_collector() {
    let (collector, _storage) = collector_with_storage();
    collector
        .start_session("session-1", "agent-1", None)
        .unwrap();

    let span = collector
        .start_span(
            "carp.resolve",
            warden_core::trace::SpanOptions::for_session("session-1"),
        )
        .unwrap();

    let first = collector
        .end_span(
            "session-1",
            &span.span_id,
            warden_core::trace::SpanStatus::Ok,
            None,
        )
        .unwrap()
        .unwrap();
    let second = collector
        .end_span(
            "session-1",
            &span.span_id,
            warden_core::trace::SpanStatus::Error,
            Some("late"),
        )
        .unwrap()
        .unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.ended_at, second.ended_at);

    // No extra lifecycle events were emitted for the idempotent end
    let events = collector.get_events("session-1").unwrap();
    let completions = events
        .iter()
        .filter(|e| e.event_type.as_str().starts_with("carp.resolve."))
        .count();
    assert_eq!(completions, 2); // started + completed
}
