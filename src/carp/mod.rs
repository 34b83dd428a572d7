//! CARP: Context & Action Resolution Protocol
//!
//! CARP is the request/response contract of the runtime: an agent states a
//! goal, the resolver answers with an authoritative resolution: what the
//! agent may read, what it may invoke, under which constraints, and for
//! how long.

mod cache;
mod executor;
mod request;
mod resolution;
mod resolver;

pub use cache::{CacheConfig, CacheKey, ResolutionCache, SweeperHandle};
pub use executor::{
    ActionHandler, ApprovalDecision, ApprovalProvider, ApprovalState, AutoApprovalProvider,
    DenyAllApprovalProvider, EchoHandler, ExecutionError, ExecutionMetrics, ExecutionOutput,
    ExecutionResult, ExecutionStatus, HandlerError, HandlerOutput, HandlerRegistry, SideEffect,
};
pub use request::{
    ActionRef, CarpRequest, Operation, RequestScope, Requester, RiskTier, TaskSpec,
    TelemetryContext,
};
pub use resolution::{
    ttl_from, ActionPermission, Constraint, ConstraintSeverity, ContentType, ContextBlock,
    Decision, DeniedAction, Evidence, ParameterConstraint, PolicyApplication, RateLimit,
    Resolution, ResolutionTtl, TelemetryLink,
};
pub use resolver::{CancellationToken, Resolver, ResolverConfig};

/// CARP protocol version
pub const VERSION: &str = "1.0";
