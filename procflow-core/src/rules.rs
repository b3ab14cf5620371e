//! Condition/action DSL evaluated at node boundaries.
//!
//! Conditions form a tree: `and`/`or` at interior nodes, field
//! comparisons at the leaves. Missing fields compare as JSON null.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Rule, RuleAction};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    Nin,
    Exists,
    Null,
}

/// A condition tree. The JSON encoding is `{"and": [..]}`,
/// `{"or": [..]}`, or `{"field": .., "op": .., "value": ..}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    All {
        and: Vec<Condition>,
    },
    Any {
        or: Vec<Condition>,
    },
    Cmp {
        field: String,
        op: CmpOp,
        #[serde(default)]
        value: Value,
    },
}

impl Condition {
    /// Leaf comparison shorthand.
    pub fn cmp(field: impl Into<String>, op: CmpOp, value: Value) -> Self {
        Condition::Cmp {
            field: field.into(),
            op,
            value,
        }
    }
}

/// Resolve a dotted field path inside `data`; missing segments yield null.
fn lookup<'a>(data: &'a Value, path: &str) -> &'a Value {
    let mut cur = data;
    for seg in path.split('.') {
        match cur.get(seg) {
            Some(v) => cur = v,
            None => return &Value::Null,
        }
    }
    cur
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

/// Ordering comparison: numbers numerically, strings lexically.
fn ordered(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_f64(lhs), as_f64(rhs)) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (lhs.as_str(), rhs.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

/// Walk the condition tree against `data`. `and` short-circuits on
/// false, `or` on true.
pub fn evaluate(cond: &Condition, data: &Value) -> bool {
    match cond {
        Condition::All { and } => and.iter().all(|c| evaluate(c, data)),
        Condition::Any { or } => or.iter().any(|c| evaluate(c, data)),
        Condition::Cmp { field, op, value } => {
            let actual = lookup(data, field);
            match op {
                CmpOp::Eq => actual == value,
                CmpOp::Ne => actual != value,
                CmpOp::Gt => matches!(ordered(actual, value), Some(std::cmp::Ordering::Greater)),
                CmpOp::Ge => matches!(
                    ordered(actual, value),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                ),
                CmpOp::Lt => matches!(ordered(actual, value), Some(std::cmp::Ordering::Less)),
                CmpOp::Le => matches!(
                    ordered(actual, value),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                ),
                CmpOp::In => value
                    .as_array()
                    .map_or(false, |arr| arr.iter().any(|v| v == actual)),
                CmpOp::Nin => value
                    .as_array()
                    .map_or(true, |arr| !arr.iter().any(|v| v == actual)),
                CmpOp::Exists => !actual.is_null(),
                CmpOp::Null => actual.is_null(),
            }
        }
    }
}

/// Outcome of evaluating a rule set: the matched rules' actions, in
/// priority-then-declaration order.
#[derive(Clone, Debug, Default)]
pub struct RuleOutcome {
    pub matched_rules: Vec<String>,
    pub actions: Vec<RuleAction>,
}

/// Evaluate `rules` against `data` at `now`.
///
/// Inactive rules are skipped. Active rules run in `priority desc`
/// order; evaluation stops after the first matching rule that carries a
/// terminal action, otherwise all matches contribute their actions.
pub fn evaluate_rules(rules: &[Rule], data: &Value, now: DateTime<Utc>) -> RuleOutcome {
    let mut sorted: Vec<&Rule> = rules.iter().filter(|r| r.is_active(now)).collect();
    sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut outcome = RuleOutcome::default();
    for rule in sorted {
        if !evaluate(&rule.conditions, data) {
            continue;
        }
        outcome.matched_rules.push(rule.rule_key.clone());
        let terminal = rule.actions.iter().any(|a| a.terminal);
        outcome.actions.extend(rule.actions.iter().cloned());
        if terminal {
            break;
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn rule(key: &str, priority: i32, cond: Condition, terminal: bool) -> Rule {
        Rule {
            id: Uuid::now_v7(),
            rule_key: key.into(),
            template_id: None,
            node_key: None,
            conditions: cond,
            actions: vec![RuleAction {
                action_type: "set_variable".into(),
                target: Some(key.into()),
                params: json!(true),
                terminal,
            }],
            priority,
            is_enabled: true,
            effective_time: None,
            expire_time: None,
        }
    }

    #[test]
    fn leaf_comparisons() {
        let data = json!({"amount": 1200, "dept": "eng", "tags": null});
        assert!(evaluate(
            &Condition::cmp("amount", CmpOp::Gt, json!(1000)),
            &data
        ));
        assert!(evaluate(
            &Condition::cmp("dept", CmpOp::In, json!(["eng", "ops"])),
            &data
        ));
        assert!(evaluate(&Condition::cmp("tags", CmpOp::Null, json!(null)), &data));
        assert!(evaluate(
            &Condition::cmp("missing", CmpOp::Null, json!(null)),
            &data
        ));
        assert!(!evaluate(
            &Condition::cmp("missing", CmpOp::Exists, json!(null)),
            &data
        ));
    }

    #[test]
    fn dotted_paths_resolve_nested_objects() {
        let data = json!({"form": {"leave": {"days": 3}}});
        assert!(evaluate(
            &Condition::cmp("form.leave.days", CmpOp::Le, json!(5)),
            &data
        ));
    }

    #[test]
    fn and_or_short_circuit() {
        let data = json!({"a": 1});
        let cond = Condition::All {
            and: vec![
                Condition::cmp("a", CmpOp::Eq, json!(1)),
                Condition::Any {
                    or: vec![
                        Condition::cmp("a", CmpOp::Eq, json!(2)),
                        Condition::cmp("a", CmpOp::Exists, json!(null)),
                    ],
                },
            ],
        };
        assert!(evaluate(&cond, &data));
    }

    #[test]
    fn untagged_json_round_trips() {
        let raw = json!({
            "and": [
                {"field": "amount", "op": "ge", "value": 100},
                {"or": [
                    {"field": "dept", "op": "eq", "value": "eng"},
                    {"field": "dept", "op": "eq", "value": "ops"}
                ]}
            ]
        });
        let cond: Condition = serde_json::from_value(raw).unwrap();
        assert!(evaluate(&cond, &json!({"amount": 150, "dept": "ops"})));
        assert!(!evaluate(&cond, &json!({"amount": 150, "dept": "hr"})));
    }

    #[test]
    fn priority_order_and_terminal_stop() {
        let data = json!({"x": 1});
        let always = Condition::cmp("x", CmpOp::Eq, json!(1));
        let rules = vec![
            rule("low", 1, always.clone(), false),
            rule("high-terminal", 10, always.clone(), true),
            rule("mid", 5, always, false),
        ];
        let out = evaluate_rules(&rules, &data, Utc::now());
        // Highest priority matched first and its terminal action stopped the run.
        assert_eq!(out.matched_rules, vec!["high-terminal".to_string()]);
        assert_eq!(out.actions.len(), 1);
    }

    #[test]
    fn disabled_and_expired_rules_are_skipped() {
        let data = json!({"x": 1});
        let always = Condition::cmp("x", CmpOp::Eq, json!(1));
        let mut expired = rule("expired", 10, always.clone(), false);
        expired.expire_time = Some(Utc::now() - chrono::Duration::hours(1));
        let mut disabled = rule("disabled", 10, always.clone(), false);
        disabled.is_enabled = false;
        let live = rule("live", 1, always, false);

        let out = evaluate_rules(&[expired, disabled, live], &data, Utc::now());
        assert_eq!(out.matched_rules, vec!["live".to_string()]);
    }
}
