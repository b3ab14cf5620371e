use async_trait::async_trait;

use super::{HandlerDeps, NodeHandler, Outcome};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::{NodeInstance, NodeType, ProcessInstance};

/// Parallel (AND) fork: activates every outgoing edge at once. The
/// engine gates entry to the join node (precomputed at template
/// validation and stored in `branch_nodes`) on arrival of all forked
/// branches, using the store's join barrier.
pub struct ParallelHandler;

#[async_trait]
impl NodeHandler for ParallelHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Parallel
    }

    async fn enter(
        &self,
        _ctx: &ExecutionContext,
        deps: &HandlerDeps,
        process: &mut ProcessInstance,
        node: &mut NodeInstance,
    ) -> Result<Outcome> {
        // Fresh barrier for the join this fork feeds; a second entry of
        // the fork (loop) must count from zero again.
        for join_key in &node.branch_nodes {
            deps.store.join_reset(process.id, join_key).await?;
        }
        Ok(Outcome::Advance(node.next_nodes.clone()))
    }
}
