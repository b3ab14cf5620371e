use async_trait::async_trait;
use tracing::warn;

use super::{HandlerDeps, NodeHandler, Outcome};
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::types::{NodeInstance, NodeType, ProcessInstance, Task};

/// Entry point of every process: completes immediately and advances to
/// its single successor.
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn enter(
        &self,
        _ctx: &ExecutionContext,
        _deps: &HandlerDeps,
        _process: &mut ProcessInstance,
        node: &mut NodeInstance,
    ) -> Result<Outcome> {
        match node.next_nodes.first() {
            Some(next) => Ok(Outcome::Advance(vec![next.clone()])),
            None => Ok(Outcome::Error(EngineError::Validation(format!(
                "start node {} has no successor",
                node.node_key
            )))),
        }
    }

    async fn on_task_resolved(
        &self,
        _ctx: &ExecutionContext,
        _deps: &HandlerDeps,
        _process: &mut ProcessInstance,
        node: &mut NodeInstance,
        _task: &Task,
    ) -> Result<Outcome> {
        // Start nodes never own tasks.
        warn!(node_key = %node.node_key, "task resolved against a start node");
        Ok(Outcome::Remain)
    }
}
