use async_trait::async_trait;
use tracing::debug;

use super::{compute_due_time, HandlerDeps, NodeHandler, Outcome};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::{NodeInstance, NodeType, ProcessInstance, Task};

/// Carbon-copy notification: creates one non-blocking task per
/// recipient and advances immediately — creation never suspends
/// progress.
pub struct CcHandler;

#[async_trait]
impl NodeHandler for CcHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Cc
    }

    async fn enter(
        &self,
        _ctx: &ExecutionContext,
        deps: &HandlerDeps,
        process: &mut ProcessInstance,
        node: &mut NodeInstance,
    ) -> Result<Outcome> {
        for recipient in &node.assignees {
            let mut task = Task::new(process.id, node, vec![recipient.clone()]);
            task.due_time = compute_due_time(task.start_time, node);
            // Fire-and-forget: CC recipients only read.
            if let Err(err) = deps.batcher.add(task, process.priority) {
                debug!(node_key = %node.node_key, %err, "cc task enqueue failed");
            }
        }
        Ok(Outcome::Advance(node.next_nodes.clone()))
    }
}
