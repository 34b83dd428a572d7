//! Error types for Warden operations

use thiserror::Error;

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// A per-field diagnostic attached to request validation failures
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldDiagnostic {
    /// Dotted path of the offending field (e.g. `requester.agent_id`)
    pub field: String,

    /// What is wrong with it
    pub message: String,
}

impl FieldDiagnostic {
    /// Create a new diagnostic
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors that can occur in Warden operations
#[derive(Error, Debug)]
pub enum WardenError {
    // Request errors
    #[error("Invalid CARP request ({} field errors)", diagnostics.len())]
    InvalidRequest { diagnostics: Vec<FieldDiagnostic> },

    #[error("Unsupported protocol version: expected {expected}, got {actual}")]
    InvalidVersion { expected: String, actual: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid format for {field}: {reason}")]
    InvalidFormat { field: String, reason: String },

    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Auth token expired")]
    TokenExpired,

    // Atlas errors
    #[error("Atlas not found: {reference}")]
    AtlasNotFound { reference: String },

    #[error("Domain not found: {domain}")]
    DomainNotFound { domain: String },

    #[error("Failed to load atlas from {path}: {reason}")]
    AtlasLoad { path: String, reason: String },

    #[error("Invalid atlas manifest: {reason}")]
    InvalidManifest { reason: String },

    // Resolution errors
    #[error("Resolution not found: {resolution_id}")]
    ResolutionNotFound { resolution_id: String },

    #[error("Resolution expired: {resolution_id}")]
    ResolutionExpired { resolution_id: String },

    // Action errors
    #[error("Action not permitted: {action_id}")]
    ActionNotPermitted { action_id: String },

    #[error("Action denied: {action_id}: {reason}")]
    ActionDenied { action_id: String, reason: String },

    #[error("Constraint violated: {constraint}: {reason}")]
    ConstraintViolated { constraint: String, reason: String },

    #[error("Execution failed for action {action_id}: {reason}")]
    ExecutionFailed {
        action_id: String,
        reason: String,
        retriable: bool,
    },

    #[error("Rate limit exceeded for action {action_id}, retry after {retry_after_seconds}s")]
    RateLimited {
        action_id: String,
        retry_after_seconds: u64,
    },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Resolution cancelled")]
    Cancelled,

    // Session errors
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session already ended: {session_id}")]
    SessionEnded { session_id: String },

    // TRACE errors
    #[error("Trace chain integrity failure: {reason}")]
    ChainIntegrity { reason: String },

    #[error("Replay failed: {reason}")]
    Replay { reason: String },

    // Storage errors
    #[error("Storage failure: {reason}")]
    Storage { reason: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error("Service unavailable: {reason}")]
    ServiceUnavailable { reason: String },
}

impl WardenError {
    /// Returns the CARP wire error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            WardenError::InvalidRequest { .. } => "INVALID_REQUEST",
            WardenError::InvalidVersion { .. } => "INVALID_VERSION",
            WardenError::MissingField { .. } => "MISSING_FIELD",
            WardenError::InvalidFormat { .. } => "INVALID_FORMAT",
            WardenError::Unauthorized { .. } => "UNAUTHORIZED",
            WardenError::Forbidden { .. } => "FORBIDDEN",
            WardenError::TokenExpired => "TOKEN_EXPIRED",
            WardenError::AtlasNotFound { .. } => "ATLAS_NOT_FOUND",
            WardenError::DomainNotFound { .. } => "DOMAIN_NOT_FOUND",
            WardenError::AtlasLoad { .. } => "ATLAS_NOT_FOUND",
            WardenError::InvalidManifest { .. } => "INVALID_FORMAT",
            WardenError::ResolutionNotFound { .. } => "RESOLUTION_NOT_FOUND",
            WardenError::ResolutionExpired { .. } => "RESOLUTION_EXPIRED",
            WardenError::ActionNotPermitted { .. } => "ACTION_NOT_PERMITTED",
            WardenError::ActionDenied { .. } => "ACTION_DENIED",
            WardenError::ConstraintViolated { .. } => "CONSTRAINT_VIOLATED",
            WardenError::ExecutionFailed { .. } => "EXECUTION_FAILED",
            WardenError::RateLimited { .. } => "RATE_LIMITED",
            WardenError::Timeout { .. } => "TIMEOUT",
            WardenError::Cancelled => "TIMEOUT",
            WardenError::SessionNotFound { .. } => "INVALID_REQUEST",
            WardenError::SessionEnded { .. } => "INVALID_REQUEST",
            WardenError::ChainIntegrity { .. } => "INTERNAL_ERROR",
            WardenError::Replay { .. } => "INTERNAL_ERROR",
            WardenError::Storage { .. } => "SERVICE_UNAVAILABLE",
            WardenError::Json(_) => "INVALID_FORMAT",
            WardenError::Yaml(_) => "INVALID_FORMAT",
            WardenError::Io(_) => "INTERNAL_ERROR",
            WardenError::Internal { .. } => "INTERNAL_ERROR",
            WardenError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
        }
    }

    /// Returns true if a caller may retry the failed operation as-is
    pub fn is_retriable(&self) -> bool {
        match self {
            WardenError::RateLimited { .. }
            | WardenError::Timeout { .. }
            | WardenError::Storage { .. }
            | WardenError::ServiceUnavailable { .. } => true,
            WardenError::ExecutionFailed { retriable, .. } => *retriable,
            _ => false,
        }
    }

    /// Returns true if this error was caused by the caller's input
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            WardenError::InvalidRequest { .. }
                | WardenError::InvalidVersion { .. }
                | WardenError::MissingField { .. }
                | WardenError::InvalidFormat { .. }
        )
    }

    /// Build an invalid-request error from a single diagnostic
    pub fn invalid_request(field: impl Into<String>, message: impl Into<String>) -> Self {
        WardenError::InvalidRequest {
            diagnostics: vec![FieldDiagnostic::new(field, message)],
        }
    }
}

/// Wire-level error response body
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    /// Wire error code from the enumerated CARP set
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Per-field diagnostics, when the error is a validation failure
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub diagnostics: Vec<FieldDiagnostic>,

    /// Whether the caller may retry
    pub retriable: bool,
}

impl From<&WardenError> for ErrorResponse {
    fn from(err: &WardenError) -> Self {
        let diagnostics = match err {
            WardenError::InvalidRequest { diagnostics } => diagnostics.clone(),
            _ => vec![],
        };
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
            diagnostics,
            retriable: err.is_retriable(),
        }
    }
}
