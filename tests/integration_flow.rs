//! End-to-end resolution and execution flows against in-memory atlases

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use warden_core::atlas::{AtlasLoader, AtlasManifest, AtlasStore, AtlasStoreConfig};
use warden_core::carp::{
    CarpRequest, Decision, DenyAllApprovalProvider, EchoHandler, ExecutionStatus, RequestScope,
    Resolver, RiskTier, TaskSpec,
};
use warden_core::ident::SequentialIdSource;
use warden_core::storage::InMemoryStorage;
use warden_core::timing::FixedClock;
use warden_core::trace::{CollectorConfig, ProcessorConfig, TraceCollector};
use warden_core::WardenError;

fn instant(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

struct Harness {
    resolver: Resolver,
    collector: Arc<TraceCollector>,
    clock: Arc<FixedClock>,
}

fn harness(atlases: Vec<(serde_json::Value, Vec<(&str, &str)>)>) -> Harness {
    let clock = Arc::new(FixedClock::new(instant(0)));
    let ids = Arc::new(SequentialIdSource::new("id"));
    let storage = Arc::new(InMemoryStorage::new());

    let store = Arc::new(AtlasStore::with_parts(
        AtlasStoreConfig::default(),
        clock.clone(),
        ids.clone(),
    ));
    let loader = AtlasLoader::new().with_clock(clock.clone());
    for (manifest, packs) in atlases {
        let manifest: AtlasManifest = serde_json::from_value(manifest).unwrap();
        let content: HashMap<String, String> = packs
            .into_iter()
            .map(|(id, text)| (id.to_string(), text.to_string()))
            .collect();
        store.insert(loader.load_from_manifest(manifest, content).unwrap());
    }

    let collector = Arc::new(TraceCollector::with_parts(
        storage.clone(),
        CollectorConfig::default().with_processor(
            ProcessorConfig::default().with_poll_interval(Duration::from_millis(1)),
        ),
        clock.clone(),
        ids.clone(),
    ));

    let resolver = Resolver::new(store, collector.clone(), storage)
        .with_clock(clock.clone())
        .with_id_source(ids);

    Harness {
        resolver,
        collector,
        clock,
    }
}

fn hello_world() -> (serde_json::Value, Vec<(&'static str, &'static str)>) {
    (
        json!({
            "atlas_version": "0.1",
            "metadata": {
                "id": "hello-world",
                "version": "0.1.0",
                "name": "Hello World",
                "description": "Greeting demo atlas"
            },
            "domains": [{"id": "demo.greeting"}],
            "context_packs": [
                {
                    "id": "overview",
                    "domain": "demo.greeting",
                    "source": "context/overview.md",
                    "priority": 100
                }
            ],
            "actions": [
                {
                    "id": "greeting.send",
                    "action_type": "greeting.send",
                    "domain": "demo.greeting",
                    "name": "Send Greeting",
                    "parameters_schema": {
                        "type": "object",
                        "required": ["recipient"],
                        "properties": {"recipient": {"type": "string"}}
                    },
                    "risk_tier": "low"
                }
            ]
        }),
        vec![("overview", OVERVIEW_CONTENT)],
    )
}

const OVERVIEW_CONTENT: &str = "# Greeting overview\n\nThis atlas teaches an agent how to greet.\nKeep messages short, friendly, and addressed to a named recipient.\nNothing here is sensitive.\n";

fn ops_atlas(with_deny_rule: bool) -> (serde_json::Value, Vec<(&'static str, &'static str)>) {
    let mut policies = json!([]);
    if with_deny_rule {
        policies = json!([
            {
                "id": "risk-policy",
                "rules": [
                    {
                        "id": "deny-critical",
                        "condition": {"field": "risk_tier", "op": "eq", "value": "critical"},
                        "effect": "deny",
                        "priority": 100,
                        "message": "critical work is not automated"
                    }
                ]
            }
        ]);
    }
    (
        json!({
            "atlas_version": "0.1",
            "metadata": {"id": "ops", "version": "1.0.0", "name": "Operations"},
            "domains": [{"id": "ops.deploy"}],
            "context_packs": [
                {"id": "runbook", "domain": "ops.deploy", "source": "runbook.md", "priority": 10}
            ],
            "policies": policies,
            "actions": [
                {
                    "id": "deploy.production",
                    "action_type": "deploy.production",
                    "domain": "ops.deploy",
                    "name": "Deploy to Production",
                    "risk_tier": "critical"
                }
            ]
        }),
        vec![("runbook", "Deploy checklist: page the on-call first.")],
    )
}

#[test]
fn simple_allow_flow() {
    let h = harness(vec![hello_world()]);

    let request = CarpRequest::resolve("agent-1", "session-1", "Send a greeting").with_task(
        TaskSpec::new("Send a greeting")
            .with_risk_tier(RiskTier::Low)
            .with_context_hints(vec!["demo.greeting".to_string()]),
    );
    let resolution = h.resolver.resolve(&request).unwrap();

    assert!(matches!(resolution.decision, Decision::Allow));
    assert_eq!(resolution.request_id, request.request_id);
    assert_eq!(resolution.context_blocks.len(), 1);
    assert_eq!(
        resolution.context_blocks[0].token_count,
        warden_core::atlas::estimate_tokens(OVERVIEW_CONTENT.len())
    );
    assert_eq!(resolution.allowed_actions.len(), 1);
    assert_eq!(resolution.allowed_actions[0].action_type, "greeting.send");
    assert_eq!(
        (resolution.ttl.resolution_expires_at - resolution.timestamp).num_seconds(),
        300
    );

    // The whole flow is on the audit chain
    let verification = h.collector.verify("session-1").unwrap();
    assert!(verification.ok, "errors: {:?}", verification.errors);
    let events = h.collector.get_events("session-1").unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    for expected in [
        "session.started",
        "carp.resolve.started",
        "carp.request.received",
        "carp.context.assembled",
        "carp.actions.resolved",
        "carp.resolution.completed",
        "carp.resolve.completed",
    ] {
        assert!(names.contains(&expected), "missing {} in {:?}", expected, names);
    }
}

#[test]
fn risk_tier_deny() {
    let h = harness(vec![ops_atlas(true)]);

    let request = CarpRequest::resolve("agent-1", "session-1", "Ship it").with_task(
        TaskSpec::new("Ship it")
            .with_risk_tier(RiskTier::Critical)
            .with_context_hints(vec!["ops.deploy".to_string()]),
    );
    let resolution = h.resolver.resolve(&request).unwrap();

    match &resolution.decision {
        Decision::Deny {
            reason,
            policy_refs,
            ..
        } => {
            assert!(!policy_refs.is_empty());
            assert_eq!(policy_refs[0], "risk-policy/deny-critical");
            assert_eq!(reason, "critical work is not automated");
        }
        other => panic!("expected Deny, got {:?}", other),
    }

    // The matched rule is on the trace
    let events = h.collector.get_events("session-1").unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type.as_str() == "carp.policy.rule.matched"));
}

#[test]
fn approval_required_for_critical_action() {
    let h = harness(vec![ops_atlas(false)]);

    let request = CarpRequest::resolve("agent-1", "session-1", "Deploy the release").with_task(
        TaskSpec::new("Deploy the release")
            .with_context_hints(vec!["ops.deploy".to_string()]),
    );
    let resolution = h.resolver.resolve(&request).unwrap();

    match &resolution.decision {
        Decision::RequiresApproval {
            approvers,
            approval_timeout_seconds,
        } => {
            assert!(!approvers.is_empty());
            assert!(*approval_timeout_seconds > 0);
        }
        other => panic!("expected RequiresApproval, got {:?}", other),
    }
    assert!(resolution.allowed_actions[0].requires_approval);
}

#[test]
fn insufficient_context_for_unknown_domain() {
    let h = harness(vec![hello_world()]);

    let request = CarpRequest::resolve("agent-1", "session-1", "Do something obscure").with_task(
        TaskSpec::new("Do something obscure")
            .with_context_hints(vec!["nonexistent.domain".to_string()]),
    );
    let resolution = h.resolver.resolve(&request).unwrap();

    match &resolution.decision {
        Decision::InsufficientContext { missing_domains } => {
            assert_eq!(missing_domains, &vec!["nonexistent.domain".to_string()]);
        }
        other => panic!("expected InsufficientContext, got {:?}", other),
    }
    assert!(resolution.context_blocks.is_empty());
    assert!(resolution.allowed_actions.is_empty());
}

#[test]
fn cache_hit_returns_same_resolution() {
    let h = harness(vec![hello_world()]);

    let request = CarpRequest::resolve("agent-1", "session-1", "Send a greeting").with_task(
        TaskSpec::new("Send a greeting").with_context_hints(vec!["demo.greeting".to_string()]),
    );

    let first = h.resolver.resolve(&request).unwrap();
    let second = h.resolver.resolve(&request).unwrap();
    assert_eq!(first.resolution_id, second.resolution_id);

    let events = h.collector.get_events("session-1").unwrap();
    let hits = events
        .iter()
        .filter(|e| e.event_type.as_str() == "carp.resolution.cache_hit")
        .count();
    assert_eq!(hits, 1, "exactly the second resolve hits the cache");

    // A different goal misses
    let other = CarpRequest::resolve("agent-1", "session-1", "Say goodbye").with_task(
        TaskSpec::new("Say goodbye").with_context_hints(vec!["demo.greeting".to_string()]),
    );
    let third = h.resolver.resolve(&other).unwrap();
    assert_ne!(third.resolution_id, first.resolution_id);
}

#[test]
fn cache_expires_with_resolution_ttl() {
    let h = harness(vec![hello_world()]);

    let request = CarpRequest::resolve("agent-1", "session-1", "Send a greeting").with_task(
        TaskSpec::new("Send a greeting").with_context_hints(vec!["demo.greeting".to_string()]),
    );
    let first = h.resolver.resolve(&request).unwrap();

    h.clock.advance(chrono::Duration::seconds(301));
    let second = h.resolver.resolve(&request).unwrap();
    assert_ne!(first.resolution_id, second.resolution_id);
}

#[test]
fn execute_denied_round_trip() {
    let h = harness(vec![hello_world()]);

    let resolve = CarpRequest::resolve("agent-1", "session-1", "Send a greeting").with_task(
        TaskSpec::new("Send a greeting").with_context_hints(vec!["demo.greeting".to_string()]),
    );
    let resolution = h.resolver.resolve(&resolve).unwrap();
    assert!(resolution.is_action_allowed("greeting.send"));

    // An action outside the allowed set is refused, repeatably
    for _ in 0..2 {
        let execute = CarpRequest::execute(
            "agent-1",
            "session-1",
            &resolution.resolution_id,
            "greeting.delete",
            json!({}),
        );
        let result = h.resolver.execute(&execute);
        match result {
            Err(WardenError::ActionNotPermitted { action_id }) => {
                assert_eq!(action_id, "greeting.delete");
            }
            other => panic!("expected ActionNotPermitted, got {:?}", other.err()),
        }
    }

    // Denials are on the chain and the chain still verifies
    let verification = h.collector.verify("session-1").unwrap();
    assert!(verification.ok, "errors: {:?}", verification.errors);
    let events = h.collector.get_events("session-1").unwrap();
    let denials = events
        .iter()
        .filter(|e| e.event_type.as_str() == "carp.action.denied")
        .count();
    assert_eq!(denials, 2);
}

#[test]
fn execute_success_flow() {
    let h = harness(vec![hello_world()]);
    h.resolver
        .register_handler("greeting.send", Arc::new(EchoHandler));

    let resolve = CarpRequest::resolve("agent-1", "session-1", "Send a greeting").with_task(
        TaskSpec::new("Send a greeting").with_context_hints(vec!["demo.greeting".to_string()]),
    );
    let resolution = h.resolver.resolve(&resolve).unwrap();

    let execute = CarpRequest::execute(
        "agent-1",
        "session-1",
        &resolution.resolution_id,
        "greeting.send",
        json!({"recipient": "world"}),
    );
    let result = h.resolver.execute(&execute).unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    let output = result.result.unwrap();
    assert_eq!(output.output["echo"]["recipient"], "world");
    assert_eq!(output.output_hash.len(), 64);

    let events = h.collector.get_events("session-1").unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    for expected in [
        "carp.action.requested",
        "carp.action.started",
        "carp.action.completed",
    ] {
        assert!(names.contains(&expected), "missing {} in {:?}", expected, names);
    }
}

#[test]
fn execute_rejects_bad_parameters() {
    let h = harness(vec![hello_world()]);
    h.resolver
        .register_handler("greeting.send", Arc::new(EchoHandler));

    let resolve = CarpRequest::resolve("agent-1", "session-1", "Send a greeting").with_task(
        TaskSpec::new("Send a greeting").with_context_hints(vec!["demo.greeting".to_string()]),
    );
    let resolution = h.resolver.resolve(&resolve).unwrap();

    // `recipient` is required by the action's parameter schema
    let execute = CarpRequest::execute(
        "agent-1",
        "session-1",
        &resolution.resolution_id,
        "greeting.send",
        json!({}),
    );
    let result = h.resolver.execute(&execute);
    assert!(matches!(result, Err(WardenError::InvalidFormat { .. })));
}

#[test]
fn execute_expired_resolution() {
    let h = harness(vec![hello_world()]);

    let resolve = CarpRequest::resolve("agent-1", "session-1", "Send a greeting").with_task(
        TaskSpec::new("Send a greeting").with_context_hints(vec!["demo.greeting".to_string()]),
    );
    let resolution = h.resolver.resolve(&resolve).unwrap();

    h.clock.advance(chrono::Duration::seconds(301));
    let execute = CarpRequest::execute(
        "agent-1",
        "session-1",
        &resolution.resolution_id,
        "greeting.send",
        json!({"recipient": "world"}),
    );
    assert!(matches!(
        h.resolver.execute(&execute),
        Err(WardenError::ResolutionExpired { .. })
    ));
}

#[test]
fn execute_unknown_resolution() {
    let h = harness(vec![hello_world()]);

    let execute = CarpRequest::execute(
        "agent-1",
        "session-1",
        "no-such-resolution",
        "greeting.send",
        json!({"recipient": "world"}),
    );
    assert!(matches!(
        h.resolver.execute(&execute),
        Err(WardenError::ResolutionNotFound { .. })
    ));
}

#[test]
fn approval_denial_routes_to_not_permitted() {
    let h = harness(vec![ops_atlas(false)]);
    let resolver = h
        .resolver
        .with_approval_provider(Arc::new(DenyAllApprovalProvider));
    resolver.register_handler("deploy.production", Arc::new(EchoHandler));

    let resolve = CarpRequest::resolve("agent-1", "session-1", "Deploy").with_task(
        TaskSpec::new("Deploy").with_context_hints(vec!["ops.deploy".to_string()]),
    );
    let resolution = resolver.resolve(&resolve).unwrap();

    let execute = CarpRequest::execute(
        "agent-1",
        "session-1",
        &resolution.resolution_id,
        "deploy.production",
        json!({}),
    );
    assert!(matches!(
        resolver.execute(&execute),
        Err(WardenError::ActionNotPermitted { .. })
    ));

    let events = h.collector.get_events("session-1").unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(names.contains(&"carp.action.approval.pending"));
    assert!(names.contains(&"carp.action.denied"));
    assert!(!names.contains(&"carp.action.approved"));
}

#[test]
fn atlas_scope_restricts_selection() {
    let h = harness(vec![hello_world(), ops_atlas(false)]);

    let request = CarpRequest::resolve("agent-1", "session-1", "Send a greeting")
        .with_task(TaskSpec::new("Send a greeting"))
        .with_scope(RequestScope {
            atlases: vec!["hello-world".to_string()],
            ..RequestScope::default()
        });
    let resolution = h.resolver.resolve(&request).unwrap();

    assert!(resolution.is_action_allowed("greeting.send"));
    assert!(!resolution.is_action_allowed("deploy.production"));

    let request = CarpRequest::resolve("agent-1", "session-1", "Anything")
        .with_task(TaskSpec::new("Anything"))
        .with_scope(RequestScope {
            atlases: vec!["no-such-atlas".to_string()],
            ..RequestScope::default()
        });
    assert!(matches!(
        h.resolver.resolve(&request),
        Err(WardenError::AtlasNotFound { .. })
    ));
}

#[test]
fn invalid_request_reports_field_diagnostics() {
    let h = harness(vec![hello_world()]);

    let mut request = CarpRequest::resolve("agent-1", "session-1", "goal");
    request.task = None;
    match h.resolver.resolve(&request) {
        Err(WardenError::InvalidRequest { diagnostics }) => {
            assert!(diagnostics.iter().any(|d| d.field == "task"));
        }
        other => panic!("expected InvalidRequest, got {:?}", other.err()),
    }

    let events = h.collector.get_events("session-1").unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type.as_str() == "error.validation"));
}

#[test]
fn validate_operation_reports_partial_split() {
    let h = harness(vec![ops_atlas(false)]);

    let mut request = CarpRequest::execute(
        "agent-1",
        "session-1",
        "unused",
        "deploy.production",
        json!({}),
    );
    request.operation = warden_core::Operation::Validate;

    let resolution = h.resolver.validate(&request).unwrap();
    match &resolution.decision {
        Decision::Partial { allowed, denied } => {
            assert!(allowed.contains(&"deploy.production".to_string()));
            assert!(denied.is_empty());
        }
        other => panic!("expected Partial, got {:?}", other),
    }
}
