use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{compute_due_time, HandlerDeps, NodeHandler, Outcome};
use crate::context::ExecutionContext;
use crate::delegation;
use crate::error::{EngineError, Result};
use crate::events::{topics, EngineEvent};
use crate::types::{
    AssigneeStrategy, CountersignMode, NodeInstance, NodeType, ProcessInstance, Task, TaskAction,
    TaskStatus,
};

/// Human approval step. Fans tasks out over the node's assignees
/// (rewritten through active delegations) and decides the node from
/// task resolutions according to the countersign mode.
pub struct ApprovalHandler;

fn approved(task: &Task) -> bool {
    task.status == TaskStatus::Completed
        && matches!(task.action, Some(TaskAction::Approve | TaskAction::AutoPass))
}

fn rejected(task: &Task) -> bool {
    task.status == TaskStatus::Rejected
        || matches!(task.action, Some(TaskAction::Reject | TaskAction::AutoFail))
}

fn reject_outcome(node: &NodeInstance) -> Outcome {
    if node.continue_on_reject {
        Outcome::Advance(node.next_nodes.clone())
    } else {
        Outcome::Reject
    }
}

impl ApprovalHandler {
    /// Cancel the node's other open tasks once the node is decided.
    async fn cancel_open_siblings(
        &self,
        deps: &HandlerDeps,
        node: &NodeInstance,
        resolved_id: uuid::Uuid,
    ) -> Result<()> {
        let siblings = deps
            .store
            .list_tasks_for_node(node.process_id, &node.node_key)
            .await?;
        for mut sibling in siblings {
            if sibling.id == resolved_id || sibling.status.is_terminal() {
                continue;
            }
            sibling.status = TaskStatus::Cancelled;
            sibling.action = Some(TaskAction::Cancel);
            sibling.end_time = Some(Utc::now());
            deps.store.save_task(&sibling).await?;
            deps.bus
                .publish(EngineEvent::for_task(topics::TASK_CANCELLED, &sibling))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeHandler for ApprovalHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Approval
    }

    async fn enter(
        &self,
        ctx: &ExecutionContext,
        deps: &HandlerDeps,
        process: &mut ProcessInstance,
        node: &mut NodeInstance,
    ) -> Result<Outcome> {
        if node.assignees.is_empty() && node.candidates.is_empty() {
            return Ok(Outcome::Error(EngineError::Validation(format!(
                "approval node {} has no assignees or candidates",
                node.node_key
            ))));
        }

        match node.assignee_strategy {
            AssigneeStrategy::AnyOne => {
                // A single claimable task; candidates race to claim it.
                let mut candidates = node.assignees.clone();
                candidates.extend(node.candidates.iter().cloned());
                let mut task = Task::new(process.id, node, Vec::new());
                task.candidates = candidates;
                task.due_time = compute_due_time(task.start_time, node);
                deps.batcher
                    .add_sync(ctx.token(), task, process.priority)
                    .await?;
            }
            AssigneeStrategy::PerAssignee => {
                let now = Utc::now();
                let variables = ctx.variables();
                for assignee in &node.assignees {
                    let delegations = deps.store.list_delegations(assignee).await?;
                    let resolved = delegation::resolve(
                        assignee,
                        process.template_id,
                        &node.node_key,
                        node.node_type,
                        process,
                        &variables,
                        &delegations,
                        now,
                    );

                    let mut task = Task::new(process.id, node, vec![resolved.assignee.clone()]);
                    task.due_time = compute_due_time(task.start_time, node);
                    if let Some(from) = &resolved.delegated_from {
                        task.is_delegated = true;
                        task.delegated_from = Some(from.clone());
                        debug!(
                            node_key = %node.node_key,
                            delegator = %from,
                            delegatee = %resolved.assignee,
                            "assignee rewritten by delegation"
                        );
                    }
                    deps.batcher
                        .add_sync(ctx.token(), task, process.priority)
                        .await?;
                }
            }
        }

        Ok(Outcome::Remain)
    }

    async fn on_task_resolved(
        &self,
        _ctx: &ExecutionContext,
        deps: &HandlerDeps,
        _process: &mut ProcessInstance,
        node: &mut NodeInstance,
        task: &Task,
    ) -> Result<Outcome> {
        match node.countersign {
            CountersignMode::Any => {
                if approved(task) {
                    self.cancel_open_siblings(deps, node, task.id).await?;
                    return Ok(Outcome::Advance(node.next_nodes.clone()));
                }
                if rejected(task) {
                    self.cancel_open_siblings(deps, node, task.id).await?;
                    return Ok(reject_outcome(node));
                }
                Ok(Outcome::Remain)
            }

            CountersignMode::All => {
                if rejected(task) {
                    self.cancel_open_siblings(deps, node, task.id).await?;
                    return Ok(reject_outcome(node));
                }
                let tasks = deps
                    .store
                    .list_tasks_for_node(node.process_id, &node.node_key)
                    .await?;
                if tasks.iter().any(|t| !t.status.is_terminal()) {
                    return Ok(Outcome::Remain);
                }
                let all_approved = tasks
                    .iter()
                    .filter(|t| t.status != TaskStatus::Cancelled)
                    .all(approved);
                if all_approved {
                    Ok(Outcome::Advance(node.next_nodes.clone()))
                } else {
                    Ok(reject_outcome(node))
                }
            }

            CountersignMode::Majority => {
                let tasks = deps
                    .store
                    .list_tasks_for_node(node.process_id, &node.node_key)
                    .await?;
                if tasks.iter().any(|t| !t.status.is_terminal()) {
                    return Ok(Outcome::Remain);
                }
                // Decided = completed or rejected; system-cancelled and
                // withdrawn tasks carry no vote.
                let decided: Vec<&Task> = tasks
                    .iter()
                    .filter(|t| {
                        matches!(t.status, TaskStatus::Completed | TaskStatus::Rejected)
                    })
                    .collect();
                let approvals = decided.iter().filter(|t| approved(t)).count();
                info!(
                    node_key = %node.node_key,
                    approvals,
                    decided = decided.len(),
                    "majority countersign evaluated"
                );
                if approvals * 2 > decided.len() {
                    Ok(Outcome::Advance(node.next_nodes.clone()))
                } else {
                    Ok(reject_outcome(node))
                }
            }
        }
    }
}
