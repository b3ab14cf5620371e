//! Rewrites task assignees based on active delegations.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::rules;
use crate::types::{Delegation, NodeType, ProcessInstance, Variables};

/// The effective assignee after delegation resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedAssignee {
    pub assignee: String,
    /// Set when a delegation redirected the task.
    pub delegated_from: Option<String>,
}

impl ResolvedAssignee {
    fn direct(assignee: &str) -> Self {
        Self {
            assignee: assignee.to_string(),
            delegated_from: None,
        }
    }
}

/// Context a delegation's conditions are evaluated against.
fn delegation_data(
    process: &ProcessInstance,
    node_key: &str,
    node_type: NodeType,
    variables: &Variables,
) -> serde_json::Value {
    json!({
        "variables": serde_json::Value::Object(variables.clone()),
        "business_key": process.business_key,
        "initiator": process.initiator,
        "node_key": node_key,
        "node_type": node_type,
    })
}

/// Resolve one candidate assignee against the principal's delegations.
///
/// A delegation matches when it is active at `now`, its template/node
/// scopes are empty or equal to the task's, and its conditions (if any)
/// evaluate true against the task context. First match wins;
/// delegations are not chained, so a delegatee's own delegations are
/// never consulted.
pub fn resolve(
    assignee: &str,
    template_id: Uuid,
    node_key: &str,
    node_type: NodeType,
    process: &ProcessInstance,
    variables: &Variables,
    delegations: &[Delegation],
    now: DateTime<Utc>,
) -> ResolvedAssignee {
    let data = delegation_data(process, node_key, node_type, variables);
    for d in delegations {
        if d.delegator_id != assignee || !d.is_active(now) {
            continue;
        }
        if d.template_id.map_or(false, |t| t != template_id) {
            continue;
        }
        if d.node_type.map_or(false, |t| t != node_type) {
            continue;
        }
        if let Some(cond) = &d.conditions {
            if !rules::evaluate(cond, &data) {
                continue;
            }
        }
        return ResolvedAssignee {
            assignee: d.delegatee_id.clone(),
            delegated_from: Some(assignee.to_string()),
        };
    }
    ResolvedAssignee::direct(assignee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{CmpOp, Condition};
    use crate::types::{FlowStatus, ProcessStatus};

    fn process(template_id: Uuid) -> ProcessInstance {
        ProcessInstance {
            id: Uuid::now_v7(),
            process_key: "proc-1".into(),
            template_id,
            business_key: "bk-1".into(),
            initiator: "bob".into(),
            variables: Variables::new(),
            current_node: None,
            active_nodes: vec![],
            status: ProcessStatus::Active,
            flow_status: FlowStatus::InProgress,
            priority: 0,
            is_suspended: false,
            suspended_at: None,
            urge_count: 0,
            start_time: Utc::now(),
            end_time: None,
            due_date: None,
            parent_id: None,
        }
    }

    fn delegation(delegator: &str, delegatee: &str) -> Delegation {
        let now = Utc::now();
        Delegation {
            id: Uuid::now_v7(),
            delegator_id: delegator.into(),
            delegatee_id: delegatee.into(),
            template_id: None,
            node_type: None,
            conditions: None,
            start_time: now - chrono::Duration::hours(1),
            end_time: now + chrono::Duration::hours(1),
            is_enabled: true,
        }
    }

    #[test]
    fn first_active_match_wins_and_is_not_chained() {
        let template_id = Uuid::now_v7();
        let p = process(template_id);
        let ds = vec![
            delegation("alice", "carol"),
            delegation("alice", "dave"),
            // carol → eve must NOT apply to alice's resolution.
            delegation("carol", "eve"),
        ];
        let resolved = resolve(
            "alice",
            template_id,
            "approve",
            NodeType::Approval,
            &p,
            &Variables::new(),
            &ds,
            Utc::now(),
        );
        assert_eq!(resolved.assignee, "carol");
        assert_eq!(resolved.delegated_from.as_deref(), Some("alice"));
    }

    #[test]
    fn scope_mismatches_are_skipped() {
        let template_id = Uuid::now_v7();
        let p = process(template_id);

        let mut wrong_template = delegation("alice", "carol");
        wrong_template.template_id = Some(Uuid::now_v7());
        let mut wrong_node_type = delegation("alice", "carol");
        wrong_node_type.node_type = Some(NodeType::Cc);
        let mut disabled = delegation("alice", "carol");
        disabled.is_enabled = false;

        let resolved = resolve(
            "alice",
            template_id,
            "approve",
            NodeType::Approval,
            &p,
            &Variables::new(),
            &[wrong_template, wrong_node_type, disabled],
            Utc::now(),
        );
        assert_eq!(resolved, ResolvedAssignee::direct("alice"));
    }

    #[test]
    fn conditions_gate_the_delegation() {
        let template_id = Uuid::now_v7();
        let p = process(template_id);
        let mut d = delegation("alice", "carol");
        d.conditions = Some(Condition::cmp(
            "variables.amount",
            CmpOp::Gt,
            serde_json::json!(1000),
        ));

        let mut small = Variables::new();
        small.insert("amount".into(), serde_json::json!(10));
        let resolved = resolve(
            "alice",
            template_id,
            "approve",
            NodeType::Approval,
            &p,
            &small,
            std::slice::from_ref(&d),
            Utc::now(),
        );
        assert_eq!(resolved.delegated_from, None);

        let mut big = Variables::new();
        big.insert("amount".into(), serde_json::json!(5000));
        let resolved = resolve(
            "alice",
            template_id,
            "approve",
            NodeType::Approval,
            &p,
            &big,
            std::slice::from_ref(&d),
            Utc::now(),
        );
        assert_eq!(resolved.assignee, "carol");
    }
}
