//! CARP request types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FieldDiagnostic;
use crate::ident::{canonical_json, sha256_hex};

use super::VERSION;

/// Request operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Resolve context and actions for a goal
    Resolve,
    /// Execute an action under a prior resolution
    Execute,
    /// Report the per-action split without issuing authority
    Validate,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Resolve => "resolve",
            Operation::Execute => "execute",
            Operation::Validate => "validate",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "resolve" => Ok(Operation::Resolve),
            "execute" => Ok(Operation::Execute),
            "validate" => Ok(Operation::Validate),
            _ => Err(format!("Unknown operation: {}", s)),
        }
    }
}

/// Risk tier; totally ordered, low to critical
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Read-only, informational
    #[default]
    Low,
    /// Create/update
    Medium,
    /// Delete, financial, security-sensitive
    High,
    /// System-wide impact
    Critical,
}

impl RiskTier {
    /// Tier index: low=0, medium=1, high=2, critical=3
    pub fn index(&self) -> u8 {
        match self {
            RiskTier::Low => 0,
            RiskTier::Medium => 1,
            RiskTier::High => 2,
            RiskTier::Critical => 3,
        }
    }

    /// Whether actions of this tier need approval before execution
    pub fn requires_approval(&self) -> bool {
        matches!(self, RiskTier::High | RiskTier::Critical)
    }

    /// Lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskTier::Low),
            "medium" => Ok(RiskTier::Medium),
            "high" => Ok(RiskTier::High),
            "critical" => Ok(RiskTier::Critical),
            _ => Err(format!("Unknown risk tier: {}", s)),
        }
    }
}

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    /// Agent identity
    pub agent_id: String,

    /// Session the request belongs to
    pub session_id: String,

    /// Optional bearer token, checked by the transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// What the agent wants to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Natural-language goal
    pub goal: String,

    /// Declared risk tier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_tier: Option<RiskTier>,

    /// Domain hints for context assembly
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub context_hints: Vec<String>,

    /// Parent task for nested work
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
}

impl TaskSpec {
    /// Task with only a goal
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            risk_tier: None,
            context_hints: vec![],
            parent_task_id: None,
        }
    }

    /// Declare the risk tier
    pub fn with_risk_tier(mut self, tier: RiskTier) -> Self {
        self.risk_tier = Some(tier);
        self
    }

    /// Add context hints
    pub fn with_context_hints(mut self, hints: Vec<String>) -> Self {
        self.context_hints = hints;
        self
    }

    /// SHA-256 of the goal text
    pub fn goal_hash(&self) -> String {
        sha256_hex(self.goal.as_bytes())
    }
}

/// Reference to an action under a prior resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRef {
    /// Action to run
    pub action_id: String,

    /// Resolution that authorized it
    pub resolution_id: String,

    /// Parameters passed to the handler
    #[serde(default)]
    pub parameters: Value,
}

/// Limits on what a resolution may draw from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestScope {
    /// Atlas refs (prefix match on `id@version`); empty means all loaded
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub atlases: Vec<String>,

    /// Domain filter
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub domains: Vec<String>,

    /// Explicit action-type allow list
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub action_types: Vec<String>,

    /// Token budget for context assembly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u64>,

    /// Cap on allowed actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_actions: Option<usize>,
}

impl RequestScope {
    /// Canonical JSON of this scope, used in cache keys
    pub fn canonical(&self) -> String {
        canonical_json(&serde_json::to_value(self).unwrap_or_default())
    }
}

/// Caller-supplied telemetry correlation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TelemetryContext {
    /// Trace to correlate with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Span to nest under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

/// A CARP request; immutable once accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarpRequest {
    /// CARP protocol version (always "1.0")
    pub carp_version: String,

    /// Time-ordered request identifier (UUIDv7)
    pub request_id: String,

    /// When the request was created
    pub timestamp: DateTime<Utc>,

    /// What is being asked
    pub operation: Operation,

    /// Who is asking
    pub requester: Requester,

    /// Goal; required for `resolve`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskSpec>,

    /// Action reference; required for `execute` and `validate`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRef>,

    /// Resolution limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<RequestScope>,

    /// Telemetry correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryContext>,
}

impl CarpRequest {
    /// Build a resolve request
    pub fn resolve(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            carp_version: VERSION.to_string(),
            request_id: uuid::Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            operation: Operation::Resolve,
            requester: Requester {
                agent_id: agent_id.into(),
                session_id: session_id.into(),
                auth_token: None,
            },
            task: Some(TaskSpec::new(goal)),
            action: None,
            scope: None,
            telemetry: None,
        }
    }

    /// Build an execute request
    pub fn execute(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        resolution_id: impl Into<String>,
        action_id: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            carp_version: VERSION.to_string(),
            request_id: uuid::Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            operation: Operation::Execute,
            requester: Requester {
                agent_id: agent_id.into(),
                session_id: session_id.into(),
                auth_token: None,
            },
            task: None,
            action: Some(ActionRef {
                action_id: action_id.into(),
                resolution_id: resolution_id.into(),
                parameters,
            }),
            scope: None,
            telemetry: None,
        }
    }

    /// Set the task
    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.task = Some(task);
        self
    }

    /// Set the scope
    pub fn with_scope(mut self, scope: RequestScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Set telemetry correlation
    pub fn with_telemetry(mut self, telemetry: TelemetryContext) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// SHA-256 of the goal, or of the empty string for task-less requests
    pub fn goal_hash(&self) -> String {
        self.task
            .as_ref()
            .map(TaskSpec::goal_hash)
            .unwrap_or_else(|| sha256_hex(b""))
    }

    /// Validate required fields; pure and deterministic
    ///
    /// Returns every problem found, each with the dotted path of the
    /// offending field.
    pub fn validate(&self) -> std::result::Result<(), Vec<FieldDiagnostic>> {
        let mut diagnostics = Vec::new();

        if self.carp_version != VERSION {
            diagnostics.push(FieldDiagnostic::new(
                "carp_version",
                format!("expected {}, got {}", VERSION, self.carp_version),
            ));
        }
        if self.request_id.is_empty() {
            diagnostics.push(FieldDiagnostic::new("request_id", "must not be empty"));
        }
        if self.requester.agent_id.is_empty() {
            diagnostics.push(FieldDiagnostic::new(
                "requester.agent_id",
                "must not be empty",
            ));
        }
        if self.requester.session_id.is_empty() {
            diagnostics.push(FieldDiagnostic::new(
                "requester.session_id",
                "must not be empty",
            ));
        }

        match self.operation {
            Operation::Resolve => match &self.task {
                None => diagnostics.push(FieldDiagnostic::new("task", "required for resolve")),
                Some(task) if task.goal.is_empty() => {
                    diagnostics.push(FieldDiagnostic::new("task.goal", "must not be empty"));
                }
                Some(_) => {}
            },
            Operation::Execute | Operation::Validate => match &self.action {
                None => diagnostics.push(FieldDiagnostic::new(
                    "action",
                    format!("required for {}", self.operation),
                )),
                Some(action) => {
                    if action.action_id.is_empty() {
                        diagnostics
                            .push(FieldDiagnostic::new("action.action_id", "must not be empty"));
                    }
                    if self.operation == Operation::Execute && action.resolution_id.is_empty() {
                        diagnostics.push(FieldDiagnostic::new(
                            "action.resolution_id",
                            "must not be empty",
                        ));
                    }
                }
            },
        }

        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(diagnostics)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_request_validates() {
        let request = CarpRequest::resolve("agent-1", "session-1", "Send a greeting");
        assert!(request.validate().is_ok());
        assert_eq!(request.carp_version, VERSION);
    }

    #[test]
    fn test_validation_is_deterministic_and_reports_all_fields() {
        let mut request = CarpRequest::resolve("", "", "goal");
        request.task = None;

        let first = request.validate().unwrap_err();
        let second = request.validate().unwrap_err();
        assert_eq!(first, second);

        let fields: Vec<&str> = first.iter().map(|d| d.field.as_str()).collect();
        assert!(fields.contains(&"requester.agent_id"));
        assert!(fields.contains(&"requester.session_id"));
        assert!(fields.contains(&"task"));
    }

    #[test]
    fn test_execute_requires_action_and_resolution() {
        let mut request =
            CarpRequest::execute("agent-1", "session-1", "res-1", "greeting.send", json!({}));
        assert!(request.validate().is_ok());

        request.action.as_mut().unwrap().resolution_id = String::new();
        let diagnostics = request.validate().unwrap_err();
        assert_eq!(diagnostics[0].field, "action.resolution_id");

        request.action = None;
        let diagnostics = request.validate().unwrap_err();
        assert_eq!(diagnostics[0].field, "action");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut request = CarpRequest::resolve("agent-1", "session-1", "goal");
        request.carp_version = "2.0".to_string();
        let diagnostics = request.validate().unwrap_err();
        assert_eq!(diagnostics[0].field, "carp_version");
    }

    #[test]
    fn test_risk_tier_ordering_and_index() {
        assert_eq!(RiskTier::Low.index(), 0);
        assert_eq!(RiskTier::Critical.index(), 3);
        assert!(RiskTier::Low < RiskTier::Critical);
        assert!(RiskTier::High.requires_approval());
        assert!(!RiskTier::Medium.requires_approval());
        assert_eq!("critical".parse::<RiskTier>().unwrap(), RiskTier::Critical);
    }

    #[test]
    fn test_scope_canonical_is_order_stable() {
        let scope = RequestScope {
            atlases: vec!["hello-world".to_string()],
            max_context_tokens: Some(1000),
            ..RequestScope::default()
        };
        assert_eq!(scope.canonical(), scope.clone().canonical());
        assert!(scope.canonical().contains("\"max_context_tokens\":1000"));
    }

    #[test]
    fn test_request_round_trips_through_json() {
        let request = CarpRequest::resolve("agent-1", "session-1", "goal")
            .with_task(
                TaskSpec::new("goal")
                    .with_risk_tier(RiskTier::High)
                    .with_context_hints(vec!["demo.greeting".to_string()]),
            )
            .with_scope(RequestScope {
                max_context_tokens: Some(500),
                ..RequestScope::default()
            });

        let json = serde_json::to_string(&request).unwrap();
        let parsed: CarpRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, request.request_id);
        assert_eq!(parsed.task.unwrap().risk_tier, Some(RiskTier::High));
    }
}
