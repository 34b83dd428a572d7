//! CARP Resolver
//!
//! The resolver is the public contract of the runtime: `resolve` turns a
//! request into a resolution (validation, atlas selection, context
//! assembly, action projection, policy evaluation, decision synthesis,
//! caching), `execute` gates and runs an action under a prior resolution,
//! and `validate` reports the per-action split without issuing authority.
//!
//! One span wraps every call; spans are closed on every exit path. Panics
//! from subsystems are caught at this boundary, logged as
//! `error.internal`, and never propagate into event emission.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::atlas::{
    ActionQuery, AtlasStore, ContextQuery, LoadedAtlas, PolicyContext, PolicyEffect,
    PolicyOutcome,
};
use crate::error::{Result, WardenError};
use crate::ident::{hash_value, IdSource, UuidV7Source};
use crate::storage::StorageAdapter;
use crate::timing::{Clock, RateLimitDecision, SlidingWindowLimiter, SystemClock};
use crate::trace::{
    event_names, EventType, RecordOptions, Severity, SpanOptions, SpanStatus, TraceCollector,
};

use super::cache::{CacheKey, ResolutionCache};
use super::executor::{
    ActionHandler, ApprovalDecision, ApprovalProvider, ApprovalState, AutoApprovalProvider,
    ExecutionResult, HandlerRegistry,
};
use super::request::{CarpRequest, Operation, RiskTier, TaskSpec};
use super::resolution::{
    ttl_from, Constraint, ContextBlock, Decision, DeniedAction, Evidence, Resolution,
    TelemetryLink,
};
use super::VERSION;

/// Cooperative cancellation for an in-flight resolve
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Fresh, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Resolution TTL in seconds
    pub default_ttl_seconds: u64,

    /// Context token budget when the scope declares none
    pub default_max_context_tokens: u64,

    /// Allowed-action cap when the scope declares none
    pub default_max_actions: usize,

    /// Roles asked to approve gated actions
    pub approver_roles: Vec<String>,

    /// How long approvals may take
    pub approval_timeout_seconds: u64,

    /// Optional deadline on a resolve call
    pub resolve_deadline: Option<Duration>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            default_max_context_tokens: 4096,
            default_max_actions: 32,
            approver_roles: vec!["runtime-operator".to_string()],
            approval_timeout_seconds: 600,
            resolve_deadline: None,
        }
    }
}

impl ResolverConfig {
    /// Set the resolution TTL
    pub fn with_ttl_seconds(mut self, ttl: u64) -> Self {
        self.default_ttl_seconds = ttl;
        self
    }

    /// Set the default context token budget
    pub fn with_max_context_tokens(mut self, tokens: u64) -> Self {
        self.default_max_context_tokens = tokens;
        self
    }

    /// Set the default allowed-action cap
    pub fn with_max_actions(mut self, max: usize) -> Self {
        self.default_max_actions = max;
        self
    }

    /// Set the approver roles
    pub fn with_approvers(mut self, roles: Vec<String>) -> Self {
        self.approver_roles = roles;
        self
    }

    /// Set a deadline on resolve calls
    pub fn with_resolve_deadline(mut self, deadline: Duration) -> Self {
        self.resolve_deadline = Some(deadline);
        self
    }
}

/// Everything the assembly phase produced for one request
struct Assembly {
    context_blocks: Vec<ContextBlock>,
    allowed_actions: Vec<super::resolution::ActionPermission>,
    denied_actions: Vec<DeniedAction>,
    outcome: PolicyOutcome,
    evidence: Vec<Evidence>,
    hints: Vec<String>,
}

/// The authority runtime's public contract
pub struct Resolver {
    atlas_store: Arc<AtlasStore>,
    collector: Arc<TraceCollector>,
    cache: Arc<ResolutionCache>,
    storage: Arc<dyn StorageAdapter>,
    approval: Arc<dyn ApprovalProvider>,
    handlers: RwLock<HandlerRegistry>,
    request_rate: SlidingWindowLimiter,
    action_rate: SlidingWindowLimiter,
    config: ResolverConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl Resolver {
    /// Create a resolver over the given store, collector, and storage
    pub fn new(
        atlas_store: Arc<AtlasStore>,
        collector: Arc<TraceCollector>,
        storage: Arc<dyn StorageAdapter>,
    ) -> Self {
        Self {
            atlas_store,
            collector,
            cache: Arc::new(ResolutionCache::new()),
            storage,
            approval: Arc::new(AutoApprovalProvider),
            handlers: RwLock::new(HandlerRegistry::new()),
            request_rate: SlidingWindowLimiter::new(),
            action_rate: SlidingWindowLimiter::new(),
            config: ResolverConfig::default(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidV7Source),
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific resolution cache
    pub fn with_cache(mut self, cache: Arc<ResolutionCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Use a specific approval provider
    pub fn with_approval_provider(mut self, provider: Arc<dyn ApprovalProvider>) -> Self {
        self.approval = provider;
        self
    }

    /// Use a specific clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a specific identifier source
    pub fn with_id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Register an action handler; last registration per type wins
    pub fn register_handler(&self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.register(action_type, handler);
        }
    }

    /// The collector serving this resolver
    pub fn collector(&self) -> &Arc<TraceCollector> {
        &self.collector
    }

    /// Load an atlas package and invalidate cached resolutions that
    /// reference a prior generation of it
    pub fn load_atlas<P: AsRef<std::path::Path>>(&self, path: P) -> Result<Arc<LoadedAtlas>> {
        let atlas = self.atlas_store.load(path)?;
        self.cache.invalidate_atlas(&atlas.manifest.metadata.id);
        Ok(atlas)
    }

    // ---- resolve --------------------------------------------------------

    /// Resolve a request into an authoritative resolution
    pub fn resolve(&self, request: &CarpRequest) -> Result<Resolution> {
        self.resolve_cancellable(request, &CancellationToken::new())
    }

    /// Resolve with cooperative cancellation
    ///
    /// On cancellation the call emits `carp.resolution.cancelled`, drops
    /// partial outputs, and does not populate the cache.
    pub fn resolve_cancellable(
        &self,
        request: &CarpRequest,
        token: &CancellationToken,
    ) -> Result<Resolution> {
        self.with_span(request, "carp.resolve", |span_id| {
            self.resolve_inner(request, span_id, token, Instant::now())
        })
    }

    /// Report the per-action allow/deny split without issuing authority
    ///
    /// The returned resolution carries a `Partial` decision and is neither
    /// cached nor persisted.
    pub fn validate(&self, request: &CarpRequest) -> Result<Resolution> {
        self.with_span(request, "carp.validate", |span_id| {
            self.validate_inner(request, span_id)
        })
    }

    /// Execute an action under a prior resolution
    pub fn execute(&self, request: &CarpRequest) -> Result<ExecutionResult> {
        self.with_span(request, "carp.execute", |span_id| {
            self.execute_inner(request, span_id)
        })
    }

    // ---- span and panic boundary ----------------------------------------

    fn with_span<T>(
        &self,
        request: &CarpRequest,
        span_name: &str,
        body: impl FnOnce(&str) -> Result<T>,
    ) -> Result<T> {
        let session_id = request.requester.session_id.clone();
        self.collector
            .ensure_session(&session_id, &request.requester.agent_id)?;

        let mut span_opts = SpanOptions::for_session(&session_id);
        if let Some(parent) = request
            .telemetry
            .as_ref()
            .and_then(|t| t.parent_span_id.clone())
        {
            span_opts = span_opts.with_parent(parent);
        }
        let span = self.collector.start_span(span_name, span_opts)?;

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| body(&span.span_id)));
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                self.emit(
                    &session_id,
                    Some(&span.span_id),
                    event_names::ERROR_INTERNAL,
                    Severity::Error,
                    json!({
                        "request_id": request.request_id,
                        "operation": request.operation.to_string(),
                    }),
                );
                Err(WardenError::Internal {
                    reason: format!("panic during {}", span_name),
                })
            }
        };

        let (status, message) = match &result {
            Ok(_) => (SpanStatus::Ok, None),
            Err(WardenError::Cancelled) => (SpanStatus::Cancelled, Some("cancelled")),
            Err(WardenError::Timeout { .. }) => (SpanStatus::Timeout, Some("deadline exceeded")),
            Err(error) => (SpanStatus::Error, Some(error.error_code())),
        };
        let _ = self
            .collector
            .end_span(&session_id, &span.span_id, status, message);
        result
    }

    /// Emission never fails a resolution; rejections are logged
    fn emit(
        &self,
        session_id: &str,
        span_id: Option<&str>,
        name: &str,
        severity: Severity,
        payload: Value,
    ) {
        let mut opts = RecordOptions::session(session_id).with_severity(severity);
        if let Some(span_id) = span_id {
            opts = opts.with_span(span_id);
        }
        if let Err(error) = self.collector.record(EventType::new(name), payload, opts) {
            tracing::debug!(%error, event = name, "event emission rejected");
        }
    }

    fn checkpoint(
        &self,
        token: &CancellationToken,
        started: Instant,
        session_id: &str,
        span_id: &str,
    ) -> Result<()> {
        if token.is_cancelled() {
            self.emit(
                session_id,
                Some(span_id),
                event_names::RESOLUTION_CANCELLED,
                Severity::Warn,
                json!({"reason": "cancelled by caller"}),
            );
            return Err(WardenError::Cancelled);
        }
        if let Some(deadline) = self.config.resolve_deadline {
            if started.elapsed() >= deadline {
                return Err(WardenError::Timeout {
                    operation: "resolve".to_string(),
                });
            }
        }
        Ok(())
    }

    // ---- the pipeline ---------------------------------------------------

    fn check_request(
        &self,
        request: &CarpRequest,
        expected: Operation,
        span_id: &str,
    ) -> Result<()> {
        let session_id = &request.requester.session_id;
        if let Err(diagnostics) = request.validate() {
            self.emit(
                session_id,
                Some(span_id),
                event_names::ERROR_VALIDATION,
                Severity::Error,
                json!({
                    "request_id": request.request_id,
                    "diagnostics": diagnostics,
                }),
            );
            return Err(WardenError::InvalidRequest { diagnostics });
        }
        if request.operation != expected {
            return Err(WardenError::invalid_request(
                "operation",
                format!("expected {}, got {}", expected, request.operation),
            ));
        }
        Ok(())
    }

    fn resolve_inner(
        &self,
        request: &CarpRequest,
        span_id: &str,
        token: &CancellationToken,
        started: Instant,
    ) -> Result<Resolution> {
        let now = self.clock.now();
        let session_id = &request.requester.session_id;
        let agent_id = &request.requester.agent_id;

        // Window feeding the `rate.*` condition fields
        self.request_rate
            .check(&format!("resolve:{}", agent_id), u64::MAX, 60, now);

        self.emit(
            session_id,
            Some(span_id),
            event_names::REQUEST_RECEIVED,
            Severity::Info,
            json!({
                "request_id": request.request_id,
                "operation": request.operation.to_string(),
                "goal_hash": request.goal_hash(),
                "risk_tier": request.task.as_ref().and_then(|t| t.risk_tier).map(|t| t.as_str()),
            }),
        );

        self.check_request(request, Operation::Resolve, span_id)?;
        let task = request.task.as_ref().ok_or_else(|| WardenError::Internal {
            reason: "validated resolve request without task".to_string(),
        })?;

        self.checkpoint(token, started, session_id, span_id)?;

        // Cache lookup on the request fingerprint
        let cache_key = CacheKey::new(&request.goal_hash(), agent_id, request.scope.as_ref());
        if let Some(cached) = self.cache.get(&cache_key, now) {
            self.emit(
                session_id,
                Some(span_id),
                event_names::RESOLUTION_CACHE_HIT,
                Severity::Info,
                json!({
                    "request_id": request.request_id,
                    "resolution_id": cached.resolution_id,
                }),
            );
            return Ok((*cached).clone());
        }

        let assembly = self.assemble(request, task, span_id, now)?;
        self.checkpoint(token, started, session_id, span_id)?;

        let decision = self.synthesize_decision(task, &assembly);

        let ttl = ttl_from(now, self.config.default_ttl_seconds);
        let mut allowed_actions = assembly.allowed_actions;
        for permission in &mut allowed_actions {
            if permission.valid_until > ttl.resolution_expires_at {
                permission.valid_until = ttl.resolution_expires_at;
            }
        }

        let trace_id = self
            .collector
            .session(session_id)
            .map(|s| s.trace_id)
            .unwrap_or_default();

        let resolution = Resolution {
            carp_version: VERSION.to_string(),
            resolution_id: self.ids.next_id(),
            request_id: request.request_id.clone(),
            timestamp: now,
            decision,
            context_blocks: assembly.context_blocks,
            allowed_actions,
            denied_actions: assembly.denied_actions,
            policy_applications: assembly.outcome.matched_rules,
            evidence: assembly.evidence,
            ttl,
            telemetry: TelemetryLink {
                session_id: session_id.clone(),
                trace_id,
                span_id: Some(span_id.to_string()),
            },
        };

        self.storage.save_resolution(&resolution)?;
        self.cache.insert(cache_key, resolution.clone(), now);
        self.collector.note_resolution(session_id);

        self.emit(
            session_id,
            Some(span_id),
            event_names::RESOLUTION_COMPLETED,
            Severity::Info,
            json!({
                "request_id": request.request_id,
                "resolution_id": resolution.resolution_id,
                "decision": resolution.decision.kind(),
                "context_blocks": resolution.context_blocks.len(),
                "context_tokens": resolution.total_context_tokens(),
                "allowed_actions": resolution.allowed_actions.len(),
                "denied_actions": resolution.denied_actions.len(),
                "ttl_seconds": resolution.ttl.ttl_seconds,
            }),
        );
        Ok(resolution)
    }

    fn validate_inner(&self, request: &CarpRequest, span_id: &str) -> Result<Resolution> {
        let now = self.clock.now();
        let session_id = &request.requester.session_id;

        self.emit(
            session_id,
            Some(span_id),
            event_names::REQUEST_RECEIVED,
            Severity::Info,
            json!({
                "request_id": request.request_id,
                "operation": request.operation.to_string(),
                "goal_hash": request.goal_hash(),
            }),
        );

        self.check_request(request, Operation::Validate, span_id)?;
        let action_ref = request.action.as_ref().ok_or_else(|| WardenError::Internal {
            reason: "validated request without action".to_string(),
        })?;

        // Validation borrows the referenced action's tier as its task shape
        let task = TaskSpec::new(format!("validate {}", action_ref.action_id));
        let assembly = self.assemble(request, &task, span_id, now)?;

        let decision = Decision::Partial {
            allowed: assembly
                .allowed_actions
                .iter()
                .map(|a| a.action_id.clone())
                .collect(),
            denied: assembly
                .denied_actions
                .iter()
                .map(|d| d.action_id.clone())
                .collect(),
        };

        let trace_id = self
            .collector
            .session(session_id)
            .map(|s| s.trace_id)
            .unwrap_or_default();

        let resolution = Resolution {
            carp_version: VERSION.to_string(),
            resolution_id: self.ids.next_id(),
            request_id: request.request_id.clone(),
            timestamp: now,
            decision,
            context_blocks: vec![],
            allowed_actions: assembly.allowed_actions,
            denied_actions: assembly.denied_actions,
            policy_applications: assembly.outcome.matched_rules,
            evidence: assembly.evidence,
            ttl: ttl_from(now, self.config.default_ttl_seconds),
            telemetry: TelemetryLink {
                session_id: session_id.clone(),
                trace_id,
                span_id: Some(span_id.to_string()),
            },
        };

        self.emit(
            session_id,
            Some(span_id),
            event_names::RESOLUTION_COMPLETED,
            Severity::Info,
            json!({
                "request_id": request.request_id,
                "resolution_id": resolution.resolution_id,
                "decision": resolution.decision.kind(),
            }),
        );
        Ok(resolution)
    }

    /// Steps 4-9: atlas selection, context assembly, action projection,
    /// policy evaluation, evidence gathering
    fn assemble(
        &self,
        request: &CarpRequest,
        task: &TaskSpec,
        span_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Assembly> {
        let session_id = &request.requester.session_id;
        let agent_id = &request.requester.agent_id;
        let scope = request.scope.clone().unwrap_or_default();

        let loaded = self.atlas_store.list();
        if loaded.is_empty() {
            return Err(WardenError::AtlasNotFound {
                reference: "<no atlases loaded>".to_string(),
            });
        }

        let scoped: Vec<Arc<LoadedAtlas>> = if scope.atlases.is_empty() {
            loaded
        } else {
            loaded
                .into_iter()
                .filter(|atlas| {
                    scope
                        .atlases
                        .iter()
                        .any(|r| crate::atlas::ref_matches(&atlas.atlas_ref, r))
                })
                .collect()
        };
        if scoped.is_empty() {
            return Err(WardenError::AtlasNotFound {
                reference: scope.atlases.join(", "),
            });
        }

        // Hints narrow the set only when they match something; an empty
        // hinted set flows through to the InsufficientContext decision
        let hints = task.context_hints.clone();
        let matched: Vec<Arc<LoadedAtlas>> = if hints.is_empty() {
            scoped
        } else {
            scoped
                .iter()
                .filter(|atlas| hints.iter().any(|h| atlas.manifest.declares_domain(h)))
                .cloned()
                .collect()
        };

        for atlas in &matched {
            self.emit(
                session_id,
                Some(span_id),
                event_names::ATLAS_LOAD,
                Severity::Debug,
                json!({
                    "atlas_ref": atlas.atlas_ref,
                    "domains": atlas.manifest.domains.iter().map(|d| d.id.clone()).collect::<Vec<_>>(),
                    "packs": atlas.manifest.context_packs.len(),
                    "actions": atlas.manifest.actions.len(),
                }),
            );
        }

        // Context assembly under the token budget
        let max_tokens = scope
            .max_context_tokens
            .unwrap_or(self.config.default_max_context_tokens);
        let domains = if !scope.domains.is_empty() {
            scope.domains.clone()
        } else {
            hints.clone()
        };

        self.emit(
            session_id,
            Some(span_id),
            event_names::CONTEXT_SELECTED,
            Severity::Debug,
            json!({
                "atlases": matched.iter().map(|a| a.atlas_ref.clone()).collect::<Vec<_>>(),
                "domains": domains,
                "max_tokens": max_tokens,
            }),
        );

        let mut context_blocks: Vec<ContextBlock> = Vec::new();
        let mut remaining = max_tokens;
        for atlas in &matched {
            if remaining == 0 {
                break;
            }
            let blocks = self.atlas_store.get_context_blocks(
                atlas,
                &ContextQuery {
                    domains: domains.clone(),
                    tags: vec![],
                    max_tokens: remaining,
                },
            );
            let consumed: u64 = blocks.iter().map(|b| b.token_count).sum();
            remaining = remaining.saturating_sub(consumed);
            context_blocks.extend(blocks);
        }
        let total_tokens: u64 = context_blocks.iter().map(|b| b.token_count).sum();

        self.emit(
            session_id,
            Some(span_id),
            event_names::CONTEXT_ASSEMBLED,
            Severity::Info,
            json!({
                "block_count": context_blocks.len(),
                "total_tokens": total_tokens,
            }),
        );

        // Action projection under the declared risk ceiling
        let mut allowed_actions = Vec::new();
        let mut denied_actions = Vec::new();
        let mut seen = HashSet::new();
        for atlas in &matched {
            let permitted = self.atlas_store.get_action_permissions(
                atlas,
                &ActionQuery {
                    domains: domains.clone(),
                    risk_tier: task.risk_tier,
                    action_types: scope.action_types.clone(),
                },
            );

            if let Some(ceiling) = task.risk_tier {
                let unbounded = self.atlas_store.get_action_permissions(
                    atlas,
                    &ActionQuery {
                        domains: domains.clone(),
                        risk_tier: None,
                        action_types: scope.action_types.clone(),
                    },
                );
                for action in unbounded {
                    if !permitted.iter().any(|p| p.action_id == action.action_id) {
                        denied_actions.push(DeniedAction {
                            action_id: action.action_id,
                            action_type: action.action_type,
                            reason: format!(
                                "risk tier {} exceeds declared ceiling {}",
                                action.risk_tier, ceiling
                            ),
                            policy_refs: vec![],
                        });
                    }
                }
            }

            for permission in permitted {
                if seen.insert(permission.action_id.clone()) {
                    allowed_actions.push(permission);
                }
            }
        }

        let max_actions = scope.max_actions.unwrap_or(self.config.default_max_actions);
        if allowed_actions.len() > max_actions {
            for over in allowed_actions.split_off(max_actions) {
                denied_actions.push(DeniedAction {
                    action_id: over.action_id,
                    action_type: over.action_type,
                    reason: "action budget exceeded".to_string(),
                    policy_refs: vec![],
                });
            }
        }

        self.emit(
            session_id,
            Some(span_id),
            event_names::ACTIONS_RESOLVED,
            Severity::Info,
            json!({
                "allowed_count": allowed_actions.len(),
                "denied_count": denied_actions.len(),
            }),
        );

        // Policy evaluation across the matched atlases
        self.emit(
            session_id,
            Some(span_id),
            event_names::POLICY_EVALUATION_STARTED,
            Severity::Debug,
            json!({"atlas_count": matched.len()}),
        );

        let mut policy_ctx =
            PolicyContext::for_request(task.risk_tier, agent_id, session_id, now);
        policy_ctx.requests_per_minute = Some(
            self.request_rate
                .current_count(&format!("resolve:{}", agent_id)),
        );

        let mut outcome = PolicyOutcome::default();
        for atlas in &matched {
            outcome.merge(self.atlas_store.evaluate_policies(atlas, &policy_ctx));
        }

        for application in &outcome.matched_rules {
            self.emit(
                session_id,
                Some(span_id),
                event_names::POLICY_RULE_MATCHED,
                Severity::Info,
                json!({
                    "policy_id": application.policy_id,
                    "rule_id": application.rule_id,
                    "atlas_ref": application.atlas_ref,
                    "effect": application.effect.as_str(),
                    "priority": application.priority,
                }),
            );
        }

        self.emit(
            session_id,
            Some(span_id),
            event_names::POLICY_EVALUATION_COMPLETED,
            Severity::Info,
            json!({
                "matched_rules": outcome.matched_rules.len(),
                "allowed": outcome.allowed,
                "requires_approval": outcome.requires_approval,
            }),
        );

        // One documentation evidence per matched atlas
        let evidence: Vec<Evidence> = matched
            .iter()
            .map(|atlas| Evidence {
                evidence_id: self.ids.next_id(),
                evidence_type: "documentation".to_string(),
                atlas_ref: atlas.atlas_ref.clone(),
                summary: if atlas.manifest.metadata.description.is_empty() {
                    atlas.manifest.metadata.name.clone()
                } else {
                    atlas.manifest.metadata.description.clone()
                },
                uri: None,
            })
            .collect();

        Ok(Assembly {
            context_blocks,
            allowed_actions,
            denied_actions,
            outcome,
            evidence,
            hints,
        })
    }

    /// Decision synthesis precedence: deny, approval, insufficient
    /// context, elevated-risk constraints, allow
    fn synthesize_decision(&self, task: &TaskSpec, assembly: &Assembly) -> Decision {
        let outcome = &assembly.outcome;
        if !outcome.allowed {
            let reason = outcome
                .matched_rules
                .iter()
                .find(|m| m.effect == PolicyEffect::Deny)
                .and_then(|m| m.message.clone())
                .unwrap_or_else(|| "denied by policy".to_string());
            return Decision::Deny {
                reason,
                policy_refs: outcome.deny_refs(),
                remediation: None,
            };
        }

        let action_needs_approval = assembly
            .allowed_actions
            .iter()
            .any(|a| a.requires_approval);
        if outcome.requires_approval || action_needs_approval {
            return Decision::RequiresApproval {
                approvers: self.config.approver_roles.clone(),
                approval_timeout_seconds: self.config.approval_timeout_seconds,
            };
        }

        if assembly.allowed_actions.is_empty() && !assembly.hints.is_empty() {
            return Decision::InsufficientContext {
                missing_domains: assembly.hints.clone(),
            };
        }

        if matches!(task.risk_tier, Some(RiskTier::High | RiskTier::Critical)) {
            return Decision::AllowWithConstraints {
                constraints: vec![Constraint::audit_required()],
            };
        }

        Decision::Allow
    }

    // ---- execute --------------------------------------------------------

    fn execute_inner(&self, request: &CarpRequest, span_id: &str) -> Result<ExecutionResult> {
        let now = self.clock.now();
        let session_id = &request.requester.session_id;
        let agent_id = &request.requester.agent_id;

        self.check_request(request, Operation::Execute, span_id)?;
        let action_ref = request.action.as_ref().ok_or_else(|| WardenError::Internal {
            reason: "validated execute request without action".to_string(),
        })?;

        self.emit(
            session_id,
            Some(span_id),
            event_names::ACTION_REQUESTED,
            Severity::Info,
            json!({
                "action_id": action_ref.action_id,
                "resolution_id": action_ref.resolution_id,
                "parameters_hash": hash_value(&action_ref.parameters),
            }),
        );

        let resolution = self
            .storage
            .get_resolution(&action_ref.resolution_id)?
            .ok_or_else(|| WardenError::ResolutionNotFound {
                resolution_id: action_ref.resolution_id.clone(),
            })?;

        if resolution.is_expired(now) {
            return Err(WardenError::ResolutionExpired {
                resolution_id: action_ref.resolution_id.clone(),
            });
        }

        let Some(permission) = resolution.find_action(&action_ref.action_id).cloned() else {
            self.emit(
                session_id,
                Some(span_id),
                event_names::ACTION_DENIED,
                Severity::Warn,
                json!({
                    "action_id": action_ref.action_id,
                    "resolution_id": action_ref.resolution_id,
                    "reason": "action not in the resolution's allowed set",
                }),
            );
            return Err(WardenError::ActionNotPermitted {
                action_id: action_ref.action_id.clone(),
            });
        };

        if now >= permission.valid_until {
            return Err(WardenError::ResolutionExpired {
                resolution_id: action_ref.resolution_id.clone(),
            });
        }

        if let Some(limit) = permission.rate_limit {
            let key = format!("{}:{}", agent_id, permission.action_id);
            if let RateLimitDecision::Limited {
                retry_after_seconds,
            } = self
                .action_rate
                .check(&key, limit.max_calls, limit.window_seconds, now)
            {
                self.emit(
                    session_id,
                    Some(span_id),
                    event_names::ACTION_DENIED,
                    Severity::Warn,
                    json!({
                        "action_id": permission.action_id,
                        "reason": "rate limit exceeded",
                        "retry_after_seconds": retry_after_seconds,
                    }),
                );
                return Err(WardenError::RateLimited {
                    action_id: permission.action_id.clone(),
                    retry_after_seconds,
                });
            }
        }

        if let Err(reason) =
            validate_parameters(&permission.parameters_schema, &action_ref.parameters)
        {
            self.emit(
                session_id,
                Some(span_id),
                event_names::ACTION_DENIED,
                Severity::Warn,
                json!({
                    "action_id": permission.action_id,
                    "reason": reason,
                }),
            );
            return Err(WardenError::InvalidFormat {
                field: "action.parameters".to_string(),
                reason,
            });
        }

        // Approval gate: none -> pending -> {approved, denied, timed_out}
        let mut approval = ApprovalState::None;
        if permission.requires_approval {
            approval = ApprovalState::Pending;
            self.emit(
                session_id,
                Some(span_id),
                event_names::ACTION_APPROVAL_PENDING,
                Severity::Info,
                json!({
                    "action_id": permission.action_id,
                    "approvers": self.config.approver_roles,
                    "timeout_seconds": self.config.approval_timeout_seconds,
                }),
            );
            let decision = self.approval.request_approval(
                &permission.action_id,
                &self.config.approver_roles,
                Duration::from_secs(self.config.approval_timeout_seconds),
            );
            approval = decision.into();
            match decision {
                ApprovalDecision::Approved => {
                    self.emit(
                        session_id,
                        Some(span_id),
                        event_names::ACTION_APPROVED,
                        Severity::Info,
                        json!({"action_id": permission.action_id}),
                    );
                }
                ApprovalDecision::Denied => {
                    self.emit(
                        session_id,
                        Some(span_id),
                        event_names::ACTION_DENIED,
                        Severity::Warn,
                        json!({
                            "action_id": permission.action_id,
                            "reason": "approval denied",
                        }),
                    );
                    return Err(WardenError::ActionNotPermitted {
                        action_id: permission.action_id.clone(),
                    });
                }
                ApprovalDecision::TimedOut => {
                    self.emit(
                        session_id,
                        Some(span_id),
                        event_names::ACTION_DENIED,
                        Severity::Warn,
                        json!({
                            "action_id": permission.action_id,
                            "reason": "approval timed out",
                        }),
                    );
                    return Err(WardenError::Timeout {
                        operation: "approval".to_string(),
                    });
                }
            }
        }

        self.emit(
            session_id,
            Some(span_id),
            event_names::ACTION_STARTED,
            Severity::Info,
            json!({
                "action_id": permission.action_id,
                "action_type": permission.action_type,
                "parameters": action_ref.parameters,
            }),
        );

        let handler = self
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(&permission.action_type));
        let Some(handler) = handler else {
            self.emit(
                session_id,
                Some(span_id),
                event_names::ACTION_FAILED,
                Severity::Error,
                json!({
                    "action_id": permission.action_id,
                    "error": "no handler registered for action type",
                }),
            );
            return Err(WardenError::ExecutionFailed {
                action_id: permission.action_id.clone(),
                reason: format!(
                    "no handler registered for action type {}",
                    permission.action_type
                ),
                retriable: false,
            });
        };

        let started = Instant::now();
        match handler.invoke(&permission.action_type, &action_ref.parameters) {
            Ok(output) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.collector.note_action(session_id);
                let result =
                    ExecutionResult::success(&permission.action_id, output, approval, duration_ms);
                self.emit(
                    session_id,
                    Some(span_id),
                    event_names::ACTION_COMPLETED,
                    Severity::Info,
                    json!({
                        "action_id": permission.action_id,
                        "duration_ms": duration_ms,
                        "status": "success",
                        "output_hash": result.result.as_ref().map(|r| r.output_hash.clone()),
                    }),
                );
                Ok(result)
            }
            Err(error) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.emit(
                    session_id,
                    Some(span_id),
                    event_names::ACTION_FAILED,
                    Severity::Error,
                    json!({
                        "action_id": permission.action_id,
                        "duration_ms": duration_ms,
                        "error": error.message,
                        "retriable": error.retriable,
                    }),
                );
                Err(WardenError::ExecutionFailed {
                    action_id: permission.action_id.clone(),
                    reason: error.message,
                    retriable: error.retriable,
                })
            }
        }
    }
}

/// Check execute-time parameters against the permission's schema
fn validate_parameters(schema: &Value, parameters: &Value) -> std::result::Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| format!("invalid parameter schema: {}", e))?;
    if let Err(errors) = compiled.validate(parameters) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(messages.join("; "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_validate_parameters_against_schema() {
        let schema = json!({
            "type": "object",
            "required": ["recipient"],
            "properties": {"recipient": {"type": "string"}}
        });

        assert!(validate_parameters(&schema, &json!({"recipient": "world"})).is_ok());
        assert!(validate_parameters(&schema, &json!({})).is_err());
        assert!(validate_parameters(&schema, &json!({"recipient": 7})).is_err());
    }
}
