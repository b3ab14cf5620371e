use async_trait::async_trait;
use tracing::debug;

use super::{HandlerDeps, NodeHandler, Outcome};
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::rules;
use crate::types::{NodeInstance, NodeType, ProcessInstance};

/// Exclusive (XOR) branch: conditions are evaluated in order against
/// the process variables; the first true condition selects the
/// index-matched entry of `next_nodes`. When none match, the default
/// branch is taken if configured.
pub struct ExclusiveHandler;

#[async_trait]
impl NodeHandler for ExclusiveHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Exclusive
    }

    async fn enter(
        &self,
        ctx: &ExecutionContext,
        _deps: &HandlerDeps,
        _process: &mut ProcessInstance,
        node: &mut NodeInstance,
    ) -> Result<Outcome> {
        // Branch conditions see the step context's working variables,
        // which inside a parallel branch are that branch's copy.
        let data = serde_json::Value::Object(ctx.variables());

        for (idx, condition) in node.conditions.iter().enumerate() {
            if !rules::evaluate(condition, &data) {
                continue;
            }
            match node.next_nodes.get(idx) {
                Some(target) => {
                    debug!(node_key = %node.node_key, branch = %target, "exclusive branch matched");
                    return Ok(Outcome::Advance(vec![target.clone()]));
                }
                None => {
                    return Ok(Outcome::Error(EngineError::Validation(format!(
                        "exclusive node {} condition {idx} has no matching branch",
                        node.node_key
                    ))))
                }
            }
        }

        match &node.default_branch {
            Some(default) => {
                debug!(node_key = %node.node_key, branch = %default, "taking default branch");
                Ok(Outcome::Advance(vec![default.clone()]))
            }
            None => Ok(Outcome::Error(EngineError::Fatal(format!(
                "no branch matched at exclusive node {}",
                node.node_key
            )))),
        }
    }
}
