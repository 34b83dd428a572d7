//! Atlas manifest validation
//!
//! Produces a report of dotted-path issues. Any error-severity issue makes
//! a load fail atomically; warnings are surfaced but non-fatal.

use std::collections::HashSet;
use std::path::Component;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::manifest::{AtlasManifest, Condition, ConditionOp};
use super::VERSION;

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Fails the load
    Error,
    /// Surfaced but non-fatal
    Warning,
}

/// One validation finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending element, e.g. `context_packs[2].domain`
    pub path: String,

    /// Error or warning
    pub severity: IssueSeverity,

    /// What is wrong
    pub message: String,
}

impl ValidationIssue {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            severity: IssueSeverity::Error,
            message: message.into(),
        }
    }

    fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }
}

/// Result of validating a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// All findings, in document order
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Whether the manifest may be loaded
    pub fn is_valid(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Error)
    }

    /// Error-severity findings only
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    /// Join error messages for an error return
    pub fn error_summary(&self) -> String {
        self.errors()
            .iter()
            .map(|i| format!("{}: {}", i.path, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Manifest validator
pub struct AtlasValidator;

impl AtlasValidator {
    /// Validate a manifest
    pub fn validate(manifest: &AtlasManifest) -> ValidationReport {
        let mut issues = Vec::new();

        if manifest.atlas_version != VERSION {
            issues.push(ValidationIssue::error(
                "atlas_version",
                format!(
                    "unsupported manifest version: expected {}, got {}",
                    VERSION, manifest.atlas_version
                ),
            ));
        }

        if manifest.metadata.id.is_empty() {
            issues.push(ValidationIssue::error("metadata.id", "must not be empty"));
        }
        if manifest.metadata.version.is_empty() {
            issues.push(ValidationIssue::error(
                "metadata.version",
                "must not be empty",
            ));
        }
        if manifest.metadata.name.is_empty() {
            issues.push(ValidationIssue::error("metadata.name", "must not be empty"));
        }

        // Domain ids must be unique
        let mut seen_domains = HashSet::new();
        for (i, domain) in manifest.domains.iter().enumerate() {
            if !seen_domains.insert(domain.id.as_str()) {
                issues.push(ValidationIssue::error(
                    format!("domains[{}].id", i),
                    format!("duplicate domain id: {}", domain.id),
                ));
            }
        }

        // Packs: unique ids, known domains, contained sources
        let mut seen_packs = HashSet::new();
        for (i, pack) in manifest.context_packs.iter().enumerate() {
            if !seen_packs.insert(pack.id.as_str()) {
                issues.push(ValidationIssue::error(
                    format!("context_packs[{}].id", i),
                    format!("duplicate pack id: {}", pack.id),
                ));
            }
            if !manifest.declares_domain(&pack.domain) {
                issues.push(ValidationIssue::error(
                    format!("context_packs[{}].domain", i),
                    format!("pack references unknown domain: {}", pack.domain),
                ));
            }
            if let Some(problem) = source_path_problem(&pack.source) {
                issues.push(ValidationIssue::error(
                    format!("context_packs[{}].source", i),
                    problem,
                ));
            }
        }

        // Actions: unique ids, known domains
        let mut seen_actions = HashSet::new();
        for (i, action) in manifest.actions.iter().enumerate() {
            if !seen_actions.insert(action.id.as_str()) {
                issues.push(ValidationIssue::error(
                    format!("actions[{}].id", i),
                    format!("duplicate action id: {}", action.id),
                ));
            }
            if !manifest.declares_domain(&action.domain) {
                issues.push(ValidationIssue::error(
                    format!("actions[{}].domain", i),
                    format!("action references unknown domain: {}", action.domain),
                ));
            }
        }

        // Policies: unique ids, structurally valid conditions
        let mut seen_policies = HashSet::new();
        for (i, policy) in manifest.policies.iter().enumerate() {
            if !seen_policies.insert(policy.id.as_str()) {
                issues.push(ValidationIssue::error(
                    format!("policies[{}].id", i),
                    format!("duplicate policy id: {}", policy.id),
                ));
            }
            for (j, rule) in policy.rules.iter().enumerate() {
                let path = format!("policies[{}].rules[{}].condition", i, j);
                Self::validate_condition(&rule.condition, &path, &mut issues);
            }
        }

        ValidationReport { issues }
    }

    fn validate_condition(condition: &Condition, path: &str, issues: &mut Vec<ValidationIssue>) {
        match condition {
            Condition::All { all } => {
                if all.is_empty() {
                    issues.push(ValidationIssue::warning(
                        path,
                        "empty `all` combinator matches vacuously",
                    ));
                }
                for (i, child) in all.iter().enumerate() {
                    Self::validate_condition(child, &format!("{}.all[{}]", path, i), issues);
                }
            }
            Condition::Any { any } => {
                if any.is_empty() {
                    issues.push(ValidationIssue::warning(
                        path,
                        "empty `any` combinator never matches",
                    ));
                }
                for (i, child) in any.iter().enumerate() {
                    Self::validate_condition(child, &format!("{}.any[{}]", path, i), issues);
                }
            }
            Condition::Leaf { field, op, value } => {
                if field.is_empty() {
                    issues.push(ValidationIssue::error(
                        format!("{}.field", path),
                        "must not be empty",
                    ));
                }
                match op {
                    ConditionOp::In | ConditionOp::NotIn => {
                        if !value.is_array() {
                            issues.push(ValidationIssue::error(
                                format!("{}.value", path),
                                format!("operator {:?} requires an array operand", op),
                            ));
                        }
                    }
                    ConditionOp::Matches => match value {
                        Value::String(pattern) => {
                            if let Err(error) = regex::Regex::new(pattern) {
                                issues.push(ValidationIssue::error(
                                    format!("{}.value", path),
                                    format!("invalid regex: {}", error),
                                ));
                            }
                        }
                        _ => issues.push(ValidationIssue::error(
                            format!("{}.value", path),
                            "operator Matches requires a string operand",
                        )),
                    },
                    _ => {}
                }
            }
        }
    }
}

/// Reject absolute paths and parent traversal so every pack source
/// resolves inside the atlas base directory
fn source_path_problem(source: &str) -> Option<String> {
    let path = std::path::Path::new(source);
    if path.is_absolute() {
        return Some(format!("source must be relative: {}", source));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Some(format!("source must not traverse outside the atlas: {}", source));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(overrides: impl FnOnce(&mut Value)) -> AtlasManifest {
        let mut value = json!({
            "atlas_version": "0.1",
            "metadata": {"id": "a", "version": "1.0.0", "name": "A"},
            "domains": [{"id": "d1"}],
            "context_packs": [
                {"id": "p1", "domain": "d1", "source": "context/p1.md"}
            ],
            "policies": [],
            "actions": [
                {"id": "a1", "action_type": "a.one", "domain": "d1", "name": "A1"}
            ]
        });
        overrides(&mut value);
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_manifest_passes() {
        let report = AtlasValidator::validate(&manifest(|_| {}));
        assert!(report.is_valid(), "issues: {:?}", report.issues);
    }

    #[test]
    fn test_unsupported_version() {
        let report = AtlasValidator::validate(&manifest(|v| {
            v["atlas_version"] = json!("9.9");
        }));
        assert!(!report.is_valid());
        assert_eq!(report.errors()[0].path, "atlas_version");
    }

    #[test]
    fn test_missing_metadata_fields() {
        let report = AtlasValidator::validate(&manifest(|v| {
            v["metadata"]["id"] = json!("");
            v["metadata"]["name"] = json!("");
        }));
        let paths: Vec<&str> = report.errors().iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"metadata.id"));
        assert!(paths.contains(&"metadata.name"));
    }

    #[test]
    fn test_duplicate_domain() {
        let report = AtlasValidator::validate(&manifest(|v| {
            v["domains"] = json!([{"id": "d1"}, {"id": "d1"}]);
        }));
        assert!(!report.is_valid());
        assert_eq!(report.errors()[0].path, "domains[1].id");
    }

    #[test]
    fn test_pack_unknown_domain() {
        let report = AtlasValidator::validate(&manifest(|v| {
            v["context_packs"][0]["domain"] = json!("ghost");
        }));
        assert!(!report.is_valid());
        assert_eq!(report.errors()[0].path, "context_packs[0].domain");
    }

    #[test]
    fn test_action_unknown_domain() {
        let report = AtlasValidator::validate(&manifest(|v| {
            v["actions"][0]["domain"] = json!("ghost");
        }));
        assert!(!report.is_valid());
        assert_eq!(report.errors()[0].path, "actions[0].domain");
    }

    #[test]
    fn test_escaping_source_rejected() {
        for source in ["../secrets.md", "/etc/passwd"] {
            let report = AtlasValidator::validate(&manifest(|v| {
                v["context_packs"][0]["source"] = json!(source);
            }));
            assert!(!report.is_valid(), "source {} should fail", source);
            assert_eq!(report.errors()[0].path, "context_packs[0].source");
        }
    }

    #[test]
    fn test_invalid_condition_structure() {
        let report = AtlasValidator::validate(&manifest(|v| {
            v["policies"] = json!([{
                "id": "p",
                "rules": [
                    {
                        "id": "bad-regex",
                        "condition": {"field": "action_type", "op": "matches", "value": "["},
                        "effect": "deny"
                    },
                    {
                        "id": "bad-in",
                        "condition": {"field": "risk_tier", "op": "in", "value": "high"},
                        "effect": "deny"
                    }
                ]
            }]);
        }));
        assert!(!report.is_valid());
        assert_eq!(report.errors().len(), 2);
        assert!(report.errors()[0].path.starts_with("policies[0].rules[0]"));
    }

    #[test]
    fn test_empty_combinator_is_warning_only() {
        let report = AtlasValidator::validate(&manifest(|v| {
            v["policies"] = json!([{
                "id": "p",
                "rules": [{
                    "id": "vacuous",
                    "condition": {"all": []},
                    "effect": "allow"
                }]
            }]);
        }));
        assert!(report.is_valid());
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, IssueSeverity::Warning);
    }
}
