//! CARP resolution types
//!
//! A resolution is the authoritative decision artifact for a request: the
//! tagged decision, the context blocks the agent may read, the actions it
//! may invoke, the policy trail that produced the outcome, and the TTLs
//! bounding all of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atlas::PolicyEffect;

use super::request::RiskTier;

/// Severity of a constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintSeverity {
    /// Must be honored; violation fails execution
    Hard,
    /// Advisory
    Soft,
}

/// A constraint attached to a decision or an action permission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Constraint name, e.g. `audit_required`
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Hard or soft
    pub severity: ConstraintSeverity,

    /// Constraint parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl Constraint {
    /// Create a hard constraint
    pub fn hard(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            severity: ConstraintSeverity::Hard,
            parameters: None,
        }
    }

    /// Create a soft constraint
    pub fn soft(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            severity: ConstraintSeverity::Soft,
            parameters: None,
        }
    }

    /// The hard constraint attached to elevated-risk allows
    pub fn audit_required() -> Self {
        Self::hard(
            "audit_required",
            "All actions under this resolution are audited",
        )
    }

    /// Attach parameters
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// A constraint on one action parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConstraint {
    /// Parameter name
    pub parameter: String,

    /// Rule identifier (`max_length`, `pattern`, `one_of`, ...)
    pub rule: String,

    /// Rule operand
    pub value: Value,
}

/// The tagged decision of a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Proceed without conditions
    Allow,
    /// Proceed under the listed constraints
    AllowWithConstraints {
        /// Attached constraints
        constraints: Vec<Constraint>,
    },
    /// Do not proceed
    Deny {
        /// Why
        reason: String,
        /// Policy rules that produced the denial
        policy_refs: Vec<String>,
        /// What the agent could do about it
        #[serde(skip_serializing_if = "Option::is_none")]
        remediation: Option<String>,
    },
    /// A human must approve first
    RequiresApproval {
        /// Roles that may approve
        approvers: Vec<String>,
        /// How long the approval may take
        approval_timeout_seconds: u64,
    },
    /// The runtime has no knowledge for the hinted domains
    InsufficientContext {
        /// Hinted domains no loaded atlas declares
        missing_domains: Vec<String>,
    },
    /// Per-action split, issued by the `validate` operation
    Partial {
        /// Action ids that would be allowed
        allowed: Vec<String>,
        /// Action ids that would be denied
        denied: Vec<String>,
    },
}

impl Decision {
    /// Whether actions may execute under this decision
    pub fn permits_execution(&self) -> bool {
        matches!(
            self,
            Decision::Allow | Decision::AllowWithConstraints { .. } | Decision::Partial { .. }
        )
    }

    /// The tag string used in event payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::AllowWithConstraints { .. } => "allow_with_constraints",
            Decision::Deny { .. } => "deny",
            Decision::RequiresApproval { .. } => "requires_approval",
            Decision::InsufficientContext { .. } => "insufficient_context",
            Decision::Partial { .. } => "partial",
        }
    }
}

/// Context block content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Markdown document
    #[default]
    Markdown,
    /// JSON document
    Json,
    /// YAML document
    Yaml,
    /// Plain text
    Text,
}

/// An immutable, hashed slab of domain content injected into a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    /// Unique per resolution
    pub block_id: String,

    /// SHA-256 of the content bytes
    pub content_hash: String,

    /// Source atlas, `id@version`
    pub atlas_ref: String,

    /// Source pack id within the atlas
    pub pack_ref: String,

    /// Domain the pack is bound to
    pub domain: String,

    /// Content type
    pub content_type: ContentType,

    /// The content itself; immutable, hash must match byte-for-byte
    pub content: String,

    /// Estimated token count (`ceil(bytes / 4)`)
    pub token_count: u64,

    /// Seconds this block stays fresh
    pub ttl_seconds: u64,

    /// Selection priority (higher first)
    pub priority: i64,

    /// Pack tags
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,

    /// Evidence backing this block
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub evidence_refs: Vec<String>,

    /// Redaction markers applied by policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redactions: Option<Vec<String>>,
}

/// Rate limit on an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Calls allowed per window
    pub max_calls: u64,

    /// Window length in seconds
    pub window_seconds: u64,
}

/// An action the agent may invoke under a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPermission {
    /// Unique action identifier within the resolution
    pub action_id: String,

    /// Dotted action type, e.g. `api.github.create_issue`
    pub action_type: String,

    /// Human-readable name
    pub name: String,

    /// What the action does
    pub description: String,

    /// JSON-Schema-shaped parameter description
    pub parameters_schema: Value,

    /// Example invocations
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub examples: Vec<Value>,

    /// Constraints on use
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub constraints: Vec<Constraint>,

    /// Per-parameter constraints
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub parameter_constraints: Vec<ParameterConstraint>,

    /// Whether execution must pass approval first
    pub requires_approval: bool,

    /// Action risk tier
    pub risk_tier: RiskTier,

    /// Rate limit, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,

    /// Source atlas, `id@version`
    pub source_atlas: String,

    /// Permission expiry; never later than the resolution expiry
    pub valid_until: DateTime<Utc>,
}

/// An action considered and refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeniedAction {
    /// Action identifier
    pub action_id: String,

    /// Dotted action type
    pub action_type: String,

    /// Why it was refused
    pub reason: String,

    /// Policy rules involved, if any
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub policy_refs: Vec<String>,
}

/// One policy rule match recorded during evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyApplication {
    /// Policy the rule belongs to
    pub policy_id: String,

    /// Matched rule
    pub rule_id: String,

    /// Atlas the policy came from, `id@version`
    pub atlas_ref: String,

    /// Effect of the matched rule
    pub effect: PolicyEffect,

    /// Rule priority
    pub priority: i64,

    /// Rule message, if declared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PolicyApplication {
    /// `policy_id/rule_id`, used in decision policy refs
    pub fn reference(&self) -> String {
        format!("{}/{}", self.policy_id, self.rule_id)
    }
}

/// Evidence supporting a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Unique evidence identifier
    pub evidence_id: String,

    /// Evidence kind (`documentation`, ...)
    pub evidence_type: String,

    /// Atlas the evidence came from
    pub atlas_ref: String,

    /// Short description
    pub summary: String,

    /// External reference, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Resolution time bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionTtl {
    /// Nominal lifetime in seconds
    pub ttl_seconds: u64,

    /// When context blocks go stale; never later than the resolution expiry
    pub context_expires_at: DateTime<Utc>,

    /// When the resolution stops being honored
    pub resolution_expires_at: DateTime<Utc>,

    /// When a caller should re-resolve (~80% of the TTL)
    pub refresh_after: DateTime<Utc>,
}

/// Link back into TRACE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryLink {
    /// Session the resolution was issued in
    pub session_id: String,

    /// Trace carrying the resolution's events
    pub trace_id: String,

    /// Span that wrapped the resolve call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// The authoritative decision artifact for a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// CARP protocol version
    pub carp_version: String,

    /// Unique resolution identifier (UUIDv7)
    pub resolution_id: String,

    /// Request this resolution answers
    pub request_id: String,

    /// When the resolution was issued
    pub timestamp: DateTime<Utc>,

    /// The decision
    pub decision: Decision,

    /// Context the agent may read
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub context_blocks: Vec<ContextBlock>,

    /// Actions the agent may invoke; `action_id` unique within the list
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub allowed_actions: Vec<ActionPermission>,

    /// Actions considered and refused
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub denied_actions: Vec<DeniedAction>,

    /// Every policy rule that matched, in evaluation order
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub policy_applications: Vec<PolicyApplication>,

    /// Evidence backing the decision
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub evidence: Vec<Evidence>,

    /// Time bounds
    pub ttl: ResolutionTtl,

    /// Link back into TRACE
    pub telemetry: TelemetryLink,
}

impl Resolution {
    /// Whether the resolution has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ttl.resolution_expires_at
    }

    /// Whether the context blocks have gone stale at `now`
    pub fn is_context_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ttl.context_expires_at
    }

    /// Look up an allowed action by exact `action_id`
    pub fn find_action(&self, action_id: &str) -> Option<&ActionPermission> {
        self.allowed_actions
            .iter()
            .find(|a| a.action_id == action_id)
    }

    /// Whether `action_id` is allowed
    pub fn is_action_allowed(&self, action_id: &str) -> bool {
        self.find_action(action_id).is_some()
    }

    /// Sum of context block token estimates
    pub fn total_context_tokens(&self) -> u64 {
        self.context_blocks.iter().map(|b| b.token_count).sum()
    }

    /// Whether this resolution draws on the given atlas (prefix match on
    /// `id@version`)
    pub fn references_atlas(&self, atlas_ref: &str) -> bool {
        self.context_blocks
            .iter()
            .any(|b| b.atlas_ref.starts_with(atlas_ref))
            || self
                .allowed_actions
                .iter()
                .any(|a| a.source_atlas.starts_with(atlas_ref))
            || self
                .policy_applications
                .iter()
                .any(|p| p.atlas_ref.starts_with(atlas_ref))
            || self
                .evidence
                .iter()
                .any(|e| e.atlas_ref.starts_with(atlas_ref))
    }
}

/// Compute resolution time bounds from an issue instant and TTL
pub fn ttl_from(now: DateTime<Utc>, ttl_seconds: u64) -> ResolutionTtl {
    let lifetime = chrono::Duration::seconds(ttl_seconds as i64);
    let refresh = chrono::Duration::milliseconds((ttl_seconds as i64) * 800);
    ResolutionTtl {
        ttl_seconds,
        context_expires_at: now + lifetime,
        resolution_expires_at: now + lifetime,
        refresh_after: now + refresh,
    }
}
