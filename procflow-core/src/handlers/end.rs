use async_trait::async_trait;
use chrono::Utc;

use super::{HandlerDeps, NodeHandler, Outcome};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::{FlowStatus, NodeInstance, NodeType, ProcessInstance, ProcessStatus};

/// Terminal node: completes the process. The engine finalizes the
/// instance (clears `active_nodes`, persists, emits
/// `process.completed`) when it observes the terminal status.
pub struct EndHandler;

#[async_trait]
impl NodeHandler for EndHandler {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    async fn enter(
        &self,
        _ctx: &ExecutionContext,
        _deps: &HandlerDeps,
        process: &mut ProcessInstance,
        _node: &mut NodeInstance,
    ) -> Result<Outcome> {
        process.status = ProcessStatus::Completed;
        process.flow_status = FlowStatus::Approved;
        process.end_time = Some(Utc::now());
        Ok(Outcome::Remain)
    }
}
