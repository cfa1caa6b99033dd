//! Segment membership.
//!
//! Two layers, both pure functions of profile state at write time:
//! engagement-threshold bands, and a rule engine evaluating configurable
//! predicate trees against the profile document with dot-path field
//! resolution. Membership diffs are published to `cdp.segment.changes`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use cdp_core::model::Profile;

/// Engagement bands: `(name, low, high)` with membership on `[low, high)`.
const THRESHOLD_SEGMENTS: [(&str, f64, f64); 4] = [
    ("highly_engaged", 70.0, 100.0),
    ("moderately_engaged", 40.0, 70.0),
    ("at_risk", 15.0, 40.0),
    ("dormant", 0.0, 15.0),
];

/// Segments whose band contains the engagement score.
pub fn threshold_segments(engagement: f64) -> Vec<String> {
    THRESHOLD_SEGMENTS
        .iter()
        .filter(|(_, low, high)| *low <= engagement && engagement < *high)
        .map(|(name, _, _)| name.to_string())
        .collect()
}

// ─── Rule engine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOp {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

/// Predicate tree: a leaf comparison, or a conjunction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SegmentRule {
    Leaf {
        field: String,
        op: RuleOp,
        value: Value,
    },
    And(Box<SegmentRule>, Box<SegmentRule>),
}

/// Wire shape for rule configuration: `{field, operator, value, and: {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub field: String,
    pub operator: RuleOp,
    pub value: Value,
    #[serde(default, rename = "and", skip_serializing_if = "Option::is_none")]
    pub and_condition: Option<Box<RuleSpec>>,
}

impl From<RuleSpec> for SegmentRule {
    fn from(spec: RuleSpec) -> Self {
        let leaf = SegmentRule::Leaf {
            field: spec.field,
            op: spec.operator,
            value: spec.value,
        };
        match spec.and_condition {
            None => leaf,
            Some(next) => SegmentRule::And(Box::new(leaf), Box::new((*next).into())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDefinition {
    pub name: String,
    pub rule: SegmentRule,
}

/// Membership diff published downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentChange {
    pub profile_id: Uuid,
    pub segments_added: Vec<String>,
    pub segments_removed: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SegmentChange {
    /// Diff two membership sets; `None` when nothing changed. Both lists
    /// come out sorted.
    pub fn diff(profile_id: Uuid, previous: &[String], current: &[String]) -> Option<Self> {
        let mut added: Vec<String> = current
            .iter()
            .filter(|s| !previous.contains(s))
            .cloned()
            .collect();
        let mut removed: Vec<String> = previous
            .iter()
            .filter(|s| !current.contains(s))
            .cloned()
            .collect();
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        added.sort();
        removed.sort();
        Some(Self {
            profile_id,
            segments_added: added,
            segments_removed: removed,
            timestamp: Utc::now(),
        })
    }
}

/// Evaluates profiles against registered rules.
pub struct SegmentEvaluator {
    rules: RwLock<Vec<SegmentDefinition>>,
}

impl SegmentEvaluator {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(builtin_rules()),
        }
    }

    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Register a rule at runtime.
    pub fn add_rule(&self, name: impl Into<String>, spec: RuleSpec) {
        let name = name.into();
        info!(segment = %name, "segment rule registered");
        self.rules.write().push(SegmentDefinition {
            name,
            rule: spec.into(),
        });
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Names of all rules the profile currently satisfies.
    pub fn evaluate(&self, profile: &Profile) -> Vec<String> {
        let doc = match serde_json::to_value(profile) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "profile serialization failed during segment evaluation");
                return Vec::new();
            }
        };
        self.rules
            .read()
            .iter()
            .filter(|def| evaluate_rule(&doc, &def.rule))
            .map(|def| def.name.clone())
            .collect()
    }
}

impl Default for SegmentEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_rules() -> Vec<SegmentDefinition> {
    let defs = [
        (
            "high_intent_prospect",
            RuleSpec {
                field: "interaction_summary.total_events".into(),
                operator: RuleOp::Gte,
                value: Value::from(3),
                and_condition: Some(Box::new(RuleSpec {
                    field: "enrollment_status".into(),
                    operator: RuleOp::Eq,
                    value: Value::from("inquiry"),
                    and_condition: None,
                })),
            },
        ),
        (
            "engaged_learner",
            RuleSpec {
                field: "interaction_summary.total_events".into(),
                operator: RuleOp::Gte,
                value: Value::from(5),
                and_condition: None,
            },
        ),
        (
            "at_risk_student",
            RuleSpec {
                field: "scores.engagement".into(),
                operator: RuleOp::Lt,
                value: Value::from(40.0),
                and_condition: Some(Box::new(RuleSpec {
                    field: "enrollment_status".into(),
                    operator: RuleOp::Eq,
                    value: Value::from("active"),
                    and_condition: None,
                })),
            },
        ),
    ];
    defs.into_iter()
        .map(|(name, spec)| SegmentDefinition {
            name: name.to_string(),
            rule: spec.into(),
        })
        .collect()
}

/// Walk a dot-separated path through the profile document.
fn resolve_field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn evaluate_rule(doc: &Value, rule: &SegmentRule) -> bool {
    match rule {
        SegmentRule::Leaf { field, op, value } => {
            let Some(actual) = resolve_field(doc, field) else {
                return false;
            };
            compare_values(actual, *op, value)
        }
        SegmentRule::And(left, right) => evaluate_rule(doc, left) && evaluate_rule(doc, right),
    }
}

fn compare_values(actual: &Value, op: RuleOp, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(e)) => match op {
            RuleOp::Gte => a >= e,
            RuleOp::Lte => a <= e,
            RuleOp::Gt => a > e,
            RuleOp::Lt => a < e,
            RuleOp::Eq => a == e,
            RuleOp::Ne => a != e,
        },
        _ => match op {
            RuleOp::Eq => actual == expected,
            RuleOp::Ne => actual != expected,
            // Ordered comparison only makes sense for numbers.
            _ => false,
        },
    }
}
