//! Execution gating types and interfaces
//!
//! The executor consumes two out-of-core interfaces: [`ActionHandler`]
//! performs the actual side effects, and [`ApprovalProvider`] resolves
//! approval requests. The approval flow is a small state machine with a
//! single decision point and an explicit timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ident::hash_value;

/// Approval lifecycle: `none -> pending -> {approved, denied, timed_out}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// No approval involved
    None,
    /// Waiting on the provider
    Pending,
    /// Granted
    Approved,
    /// Refused; surfaced as `ACTION_NOT_PERMITTED`
    Denied,
    /// The provider did not answer in time
    TimedOut,
}

/// A provider's answer to an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Proceed
    Approved,
    /// Refuse
    Denied,
    /// No answer within the timeout
    TimedOut,
}

impl From<ApprovalDecision> for ApprovalState {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => ApprovalState::Approved,
            ApprovalDecision::Denied => ApprovalState::Denied,
            ApprovalDecision::TimedOut => ApprovalState::TimedOut,
        }
    }
}

/// Resolves approval requests for gated actions
pub trait ApprovalProvider: Send + Sync {
    /// Ask the named approver roles to approve `action_id`
    fn request_approval(
        &self,
        action_id: &str,
        approvers: &[String],
        timeout: Duration,
    ) -> ApprovalDecision;
}

/// Default provider: approves everything immediately
#[derive(Debug, Default)]
pub struct AutoApprovalProvider;

impl ApprovalProvider for AutoApprovalProvider {
    fn request_approval(&self, _: &str, _: &[String], _: Duration) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// Provider that refuses everything; useful in tests and lockdown modes
#[derive(Debug, Default)]
pub struct DenyAllApprovalProvider;

impl ApprovalProvider for DenyAllApprovalProvider {
    fn request_approval(&self, _: &str, _: &[String], _: Duration) -> ApprovalDecision {
        ApprovalDecision::Denied
    }
}

/// A side effect reported by a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    /// Effect kind (`http_request`, `file_write`, ...)
    pub effect_type: String,

    /// What was touched
    pub target: String,

    /// Detail
    #[serde(default)]
    pub description: String,
}

/// Handler failure, carried back to the caller with a retry hint
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// What went wrong
    pub message: String,

    /// Whether a retry might succeed
    pub retriable: bool,
}

impl HandlerError {
    /// A permanent failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }

    /// A transient failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }
}

/// Successful handler output
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    /// The result value
    pub output: Value,

    /// Output content type (`json`, `text`, ...)
    pub output_type: String,

    /// Side effects performed
    pub side_effects: Vec<SideEffect>,
}

impl HandlerOutput {
    /// JSON output with no side effects
    pub fn json(output: Value) -> Self {
        Self {
            output,
            output_type: "json".to_string(),
            side_effects: vec![],
        }
    }
}

/// Performs actions; registered per action type, out of core
pub trait ActionHandler: Send + Sync {
    /// Invoke the handler
    fn invoke(
        &self,
        action_type: &str,
        parameters: &Value,
    ) -> std::result::Result<HandlerOutput, HandlerError>;
}

/// Handler that echoes its parameters; useful in tests and demos
#[derive(Debug, Default)]
pub struct EchoHandler;

impl ActionHandler for EchoHandler {
    fn invoke(
        &self,
        action_type: &str,
        parameters: &Value,
    ) -> std::result::Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::json(serde_json::json!({
            "action_type": action_type,
            "echo": parameters,
        })))
    }
}

/// Registry of handlers keyed by action type
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an action type; last registration wins
    pub fn register(&mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.into(), handler);
    }

    /// Look up the handler for an action type
    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }
}

/// Execution outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Handler completed
    Success,
    /// Handler reported failure
    Failed,
}

/// Hashed handler output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// The result value
    pub output: Value,

    /// SHA-256 of the canonical output
    pub output_hash: String,

    /// Output content type
    pub output_type: String,
}

/// Execution failure detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Wire error code
    pub code: String,

    /// What went wrong
    pub message: String,

    /// Whether a retry might succeed
    pub retriable: bool,
}

/// Execution measurements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Wall time of the handler invocation
    pub duration_ms: u64,

    /// Side effects recorded
    pub side_effect_count: usize,
}

/// The shaped result of an execute request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Executed action
    pub action_id: String,

    /// Success or failure
    pub status: ExecutionStatus,

    /// Output on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionOutput>,

    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,

    /// Side effects reported by the handler
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub side_effects: Vec<SideEffect>,

    /// Approval state the execution went through
    pub approval: ApprovalState,

    /// Measurements
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    /// Shape a successful execution
    pub fn success(
        action_id: impl Into<String>,
        output: HandlerOutput,
        approval: ApprovalState,
        duration_ms: u64,
    ) -> Self {
        let output_hash = hash_value(&output.output);
        Self {
            action_id: action_id.into(),
            status: ExecutionStatus::Success,
            result: Some(ExecutionOutput {
                output: output.output,
                output_hash,
                output_type: output.output_type,
            }),
            error: None,
            side_effects: output.side_effects.clone(),
            approval,
            metrics: ExecutionMetrics {
                duration_ms,
                side_effect_count: output.side_effects.len(),
            },
        }
    }
}
