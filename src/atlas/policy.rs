//! Policy condition evaluation
//!
//! Conditions are interpreted, not compiled. A leaf predicate reads one
//! field of the evaluation context; combinators fold children with
//! `all`/`any`. A malformed condition evaluates to false and is reported
//! as a warning by the caller.

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;

use crate::carp::{PolicyApplication, RiskTier};

use super::manifest::{Condition, ConditionOp};

/// The facts a condition may test
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// Declared request risk tier
    pub risk_tier: Option<RiskTier>,

    /// Action type under consideration, if any
    pub action_type: Option<String>,

    /// Domain under consideration, if any
    pub domain: Option<String>,

    /// Requester fields, addressed as `requester.<key>`
    pub requester: HashMap<String, String>,

    /// Evaluation instant, addressed as `time.hour_utc` / `time.iso`
    pub time: Option<DateTime<Utc>>,

    /// Recent request rate, addressed as `rate.requests_per_minute`
    pub requests_per_minute: Option<u64>,
}

impl PolicyContext {
    /// Context for a request with the given tier and requester identity
    pub fn for_request(
        risk_tier: Option<RiskTier>,
        agent_id: &str,
        session_id: &str,
        time: DateTime<Utc>,
    ) -> Self {
        let mut requester = HashMap::new();
        requester.insert("agent_id".to_string(), agent_id.to_string());
        requester.insert("session_id".to_string(), session_id.to_string());
        Self {
            risk_tier,
            action_type: None,
            domain: None,
            requester,
            time: Some(time),
            requests_per_minute: None,
        }
    }

    /// Resolve a dotted field name to its current value
    ///
    /// `Err` means the field name is outside the condition vocabulary
    /// (a malformed condition); `Ok(None)` means the field is known but
    /// has no value in this context, which makes the leaf not match.
    fn resolve(&self, field: &str) -> std::result::Result<Option<Value>, String> {
        match field {
            "risk_tier" => Ok(self.risk_tier.map(|t| Value::String(t.as_str().to_string()))),
            "action_type" => Ok(self.action_type.clone().map(Value::String)),
            "domain" => Ok(self.domain.clone().map(Value::String)),
            "time.hour_utc" => Ok(self.time.map(|t| Value::from(t.hour()))),
            "time.iso" => Ok(self.time.map(|t| Value::String(t.to_rfc3339()))),
            "rate.requests_per_minute" => Ok(self.requests_per_minute.map(Value::from)),
            _ => {
                if let Some(key) = field.strip_prefix("requester.") {
                    Ok(self.requester.get(key).cloned().map(Value::String))
                } else {
                    Err(format!("unknown condition field: {}", field))
                }
            }
        }
    }
}

/// Evaluate a condition against a context
///
/// `Err` signals a malformed condition; callers log it and treat the rule
/// as not matching.
pub fn evaluate_condition(
    condition: &Condition,
    ctx: &PolicyContext,
) -> std::result::Result<bool, String> {
    match condition {
        Condition::All { all } => {
            for child in all {
                if !evaluate_condition(child, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Any { any } => {
            for child in any {
                if evaluate_condition(child, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Leaf { field, op, value } => {
            let Some(actual) = ctx.resolve(field)? else {
                return Ok(false);
            };
            evaluate_leaf(&actual, *op, value)
        }
    }
}

fn evaluate_leaf(
    actual: &Value,
    op: ConditionOp,
    operand: &Value,
) -> std::result::Result<bool, String> {
    match op {
        ConditionOp::Eq => Ok(values_equal(actual, operand)),
        ConditionOp::Neq => Ok(!values_equal(actual, operand)),
        ConditionOp::In => match operand {
            Value::Array(items) => Ok(items.iter().any(|item| values_equal(actual, item))),
            _ => Err("`in` requires an array operand".to_string()),
        },
        ConditionOp::NotIn => match operand {
            Value::Array(items) => Ok(!items.iter().any(|item| values_equal(actual, item))),
            _ => Err("`not_in` requires an array operand".to_string()),
        },
        ConditionOp::Gt | ConditionOp::Lt => {
            let operand = as_number(operand)
                .ok_or_else(|| format!("{:?} requires a numeric operand", op))?;
            let Some(actual) = as_number(actual) else {
                return Ok(false);
            };
            Ok(match op {
                ConditionOp::Gt => actual > operand,
                _ => actual < operand,
            })
        }
        ConditionOp::Matches => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| "`matches` requires a string operand".to_string())?;
            let regex =
                regex::Regex::new(pattern).map_err(|e| format!("invalid regex: {}", e))?;
            Ok(actual.as_str().map(|s| regex.is_match(s)).unwrap_or(false))
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // 2 == 2.0
    matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y)
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Composed outcome of evaluating an atlas's policies
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    /// False iff any `deny` rule matched
    pub allowed: bool,

    /// True iff any `require_approval` rule matched
    pub requires_approval: bool,

    /// Every matched rule, in evaluation order
    pub matched_rules: Vec<PolicyApplication>,

    /// Redaction markers appended by `redact` rules
    pub redactions: Vec<String>,
}

impl Default for PolicyOutcome {
    fn default() -> Self {
        Self {
            allowed: true,
            requires_approval: false,
            matched_rules: vec![],
            redactions: vec![],
        }
    }
}

impl PolicyOutcome {
    /// Fold another outcome into this one
    pub fn merge(&mut self, other: PolicyOutcome) {
        self.allowed = self.allowed && other.allowed;
        self.requires_approval = self.requires_approval || other.requires_approval;
        self.matched_rules.extend(other.matched_rules);
        self.redactions.extend(other.redactions);
    }

    /// References of matched deny rules
    pub fn deny_refs(&self) -> Vec<String> {
        self.matched_rules
            .iter()
            .filter(|m| m.effect == super::manifest::PolicyEffect::Deny)
            .map(PolicyApplication::reference)
            .collect()
    }
}
