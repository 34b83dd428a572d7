//! Atlas manifest types
//!
//! An atlas is a versioned package of context packs, action definitions,
//! and policy rules, all bound to domains. The manifest is the JSON or
//! YAML document at the package root.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::carp::{Constraint, ContentType, ParameterConstraint, RateLimit, RiskTier};

use super::VERSION;

/// Atlas identity and description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlasMetadata {
    /// Unique identifier, e.g. `hello-world`
    pub id: String,

    /// Semantic version, e.g. `0.1.0`
    pub version: String,

    /// Human-readable name
    pub name: String,

    /// What the atlas covers
    #[serde(default)]
    pub description: String,
}

/// A knowledge domain declared by an atlas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDef {
    /// Unique domain identifier, e.g. `demo.greeting`
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// What the domain covers
    #[serde(default)]
    pub description: String,
}

/// A file-backed context pack bound to a domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPackDef {
    /// Unique pack identifier within the atlas
    pub id: String,

    /// Domain this pack belongs to; must be declared by the atlas
    pub domain: String,

    /// Path of the content file, relative to the atlas root
    pub source: String,

    /// Content type
    #[serde(default)]
    pub content_type: ContentType,

    /// Selection priority (higher first)
    #[serde(default)]
    pub priority: i64,

    /// Tags used by context queries
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,

    /// Seconds a block built from this pack stays fresh
    #[serde(default = "default_pack_ttl")]
    pub ttl_seconds: u64,
}

fn default_pack_ttl() -> u64 {
    300
}

/// Effect of a matched policy rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    /// Informational allowance
    Allow,
    /// Flip the aggregate outcome to denied
    Deny,
    /// Require human approval
    RequireApproval,
    /// Append to the redaction list
    Redact,
    /// Informational constraint marker
    Constrain,
}

impl PolicyEffect {
    /// Lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyEffect::Allow => "allow",
            PolicyEffect::Deny => "deny",
            PolicyEffect::RequireApproval => "require_approval",
            PolicyEffect::Redact => "redact",
            PolicyEffect::Constrain => "constrain",
        }
    }
}

/// Comparison operator of a condition leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    /// Equality
    Eq,
    /// Inequality
    Neq,
    /// Membership in an array operand
    In,
    /// Non-membership in an array operand
    NotIn,
    /// Numeric greater-than
    Gt,
    /// Numeric less-than
    Lt,
    /// Regex match on a string field
    Matches,
}

/// A policy condition: leaf predicates combined with `all`/`any`
///
/// JSON forms:
/// `{"all": [ ... ]}`, `{"any": [ ... ]}`,
/// `{"field": "risk_tier", "op": "eq", "value": "critical"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Every child must match
    All {
        /// Children
        all: Vec<Condition>,
    },
    /// At least one child must match
    Any {
        /// Children
        any: Vec<Condition>,
    },
    /// A single predicate
    Leaf {
        /// Dotted field name (`risk_tier`, `requester.agent_id`, ...)
        field: String,
        /// Operator
        op: ConditionOp,
        /// Operand
        value: Value,
    },
}

/// One rule within a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique rule identifier within the policy
    pub id: String,

    /// What the rule is for
    #[serde(default)]
    pub description: String,

    /// When the rule applies
    pub condition: Condition,

    /// What a match does
    pub effect: PolicyEffect,

    /// Evaluation priority (higher first; stable on ties)
    #[serde(default)]
    pub priority: i64,

    /// Message surfaced with the effect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An ordered rule list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDef {
    /// Unique policy identifier within the atlas
    pub id: String,

    /// What the policy governs
    #[serde(default)]
    pub description: String,

    /// Rules, evaluated by descending priority
    pub rules: Vec<PolicyRule>,
}

/// An action definition bound to a domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    /// Unique action identifier within the atlas
    pub id: String,

    /// Dotted action type, e.g. `greeting.send`
    pub action_type: String,

    /// Domain this action belongs to; must be declared by the atlas
    pub domain: String,

    /// Human-readable name
    pub name: String,

    /// What the action does
    #[serde(default)]
    pub description: String,

    /// JSON-Schema-shaped parameter description
    #[serde(default = "default_schema")]
    pub parameters_schema: Value,

    /// Example invocations
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub examples: Vec<Value>,

    /// Risk tier
    #[serde(default)]
    pub risk_tier: RiskTier,

    /// Constraints on use
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub constraints: Vec<Constraint>,

    /// Per-parameter constraints
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub parameter_constraints: Vec<ParameterConstraint>,

    /// Rate limit, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object"})
}

/// Dependency on another atlas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlasDependency {
    /// Depended-on atlas id
    pub id: String,

    /// Version requirement
    pub version: String,
}

/// The atlas manifest document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtlasManifest {
    /// Manifest format version; `"0.1"` is the only supported value
    pub atlas_version: String,

    /// Identity and description
    pub metadata: AtlasMetadata,

    /// Declared domains; ids must be unique
    #[serde(default)]
    pub domains: Vec<DomainDef>,

    /// Context packs; each binds to a declared domain
    #[serde(default)]
    pub context_packs: Vec<ContextPackDef>,

    /// Policies
    #[serde(default)]
    pub policies: Vec<PolicyDef>,

    /// Actions; each binds to a declared domain
    #[serde(default)]
    pub actions: Vec<ActionDef>,

    /// Dependencies on other atlases
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dependencies: Vec<AtlasDependency>,

    /// Adapter configuration blobs, keyed by adapter name
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub adapters: HashMap<String, Value>,
}

impl AtlasManifest {
    /// `id@version` reference
    pub fn atlas_ref(&self) -> String {
        format!("{}@{}", self.metadata.id, self.metadata.version)
    }

    /// Whether the atlas declares `domain`
    pub fn declares_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.id == domain)
    }

    /// Look up a pack by id
    pub fn get_pack(&self, pack_id: &str) -> Option<&ContextPackDef> {
        self.context_packs.iter().find(|p| p.id == pack_id)
    }

    /// Look up an action by id
    pub fn get_action(&self, action_id: &str) -> Option<&ActionDef> {
        self.actions.iter().find(|a| a.id == action_id)
    }

    /// Look up a policy by id
    pub fn get_policy(&self, policy_id: &str) -> Option<&PolicyDef> {
        self.policies.iter().find(|p| p.id == policy_id)
    }

    /// Whether the manifest version is the supported one
    pub fn is_supported_version(&self) -> bool {
        self.atlas_version == VERSION
    }
}
