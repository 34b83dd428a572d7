//! Atlas: versioned knowledge packages
//!
//! An atlas bundles context packs, action definitions, and policy rules,
//! all bound to declared domains. The loader reads and validates packages;
//! the store owns loaded atlases and projects them into resolutions.

mod loader;
mod manifest;
mod policy;
mod store;
mod validator;

pub use loader::{AtlasLoader, LoadedAtlas};
pub use manifest::{
    ActionDef, AtlasDependency, AtlasManifest, AtlasMetadata, Condition, ConditionOp,
    ContextPackDef, DomainDef, PolicyDef, PolicyEffect, PolicyRule,
};
pub use policy::{evaluate_condition, PolicyContext, PolicyOutcome};
pub use store::{
    estimate_tokens, ref_matches, ActionQuery, AtlasMap, AtlasStore, AtlasStoreConfig,
    CachedAtlas, ContextQuery,
};
pub use validator::{AtlasValidator, IssueSeverity, ValidationIssue, ValidationReport};

/// Atlas manifest format version; the only supported value
pub const VERSION: &str = "0.1";
