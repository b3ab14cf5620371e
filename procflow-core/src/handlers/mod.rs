//! Per-node-type execution semantics.
//!
//! One handler per node type, all sharing the same contract: `enter`
//! when the engine activates a node, `on_task_resolved` when one of the
//! node's tasks reaches a terminal status. Handlers are looked up in a
//! process-wide registry built once at engine init.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc, Weekday};

use crate::batcher::TaskBatcher;
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::store::WorkflowStore;
use crate::types::{NodeInstance, NodeType, ProcessInstance, Task, Variables};

mod approval;
mod cc;
mod end;
mod exclusive;
mod parallel;
mod service;
mod start;

pub use approval::ApprovalHandler;
pub use cc::CcHandler;
pub use end::EndHandler;
pub use exclusive::ExclusiveHandler;
pub use parallel::ParallelHandler;
pub use service::ServiceNodeHandler;
pub use start::StartHandler;

/// What a handler decided about its node.
#[derive(Debug)]
pub enum Outcome {
    /// Node stays active (tasks outstanding).
    Remain,
    /// Node is done; activate these nodes next.
    Advance(Vec<String>),
    /// Node rejected; the engine transitions the process to rejected.
    Reject,
    /// Suspend the process.
    Suspend,
    /// Unrecoverable handler failure.
    Error(EngineError),
}

/// Collaborators a handler may use. Built once by the engine.
pub struct HandlerDeps {
    pub store: Arc<dyn WorkflowStore>,
    pub bus: Arc<dyn EventBus>,
    pub batcher: Arc<TaskBatcher>,
    pub services: Arc<ServiceRegistry>,
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn node_type(&self) -> NodeType;

    async fn enter(
        &self,
        ctx: &ExecutionContext,
        deps: &HandlerDeps,
        process: &mut ProcessInstance,
        node: &mut NodeInstance,
    ) -> Result<Outcome>;

    /// Called with the node still active and the resolved task already
    /// persisted. Default: nothing to do.
    async fn on_task_resolved(
        &self,
        _ctx: &ExecutionContext,
        _deps: &HandlerDeps,
        _process: &mut ProcessInstance,
        _node: &mut NodeInstance,
        _task: &Task,
    ) -> Result<Outcome> {
        Ok(Outcome::Remain)
    }
}

/// Node-type → handler dispatch table.
pub struct HandlerRegistry {
    map: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    /// The standard set covering every node type.
    pub fn standard() -> Self {
        let handlers: Vec<Arc<dyn NodeHandler>> = vec![
            Arc::new(StartHandler),
            Arc::new(ApprovalHandler),
            Arc::new(ServiceNodeHandler),
            Arc::new(ExclusiveHandler),
            Arc::new(ParallelHandler),
            Arc::new(CcHandler),
            Arc::new(EndHandler),
        ];
        let map = handlers.into_iter().map(|h| (h.node_type(), h)).collect();
        Self { map }
    }

    pub fn get(&self, node_type: NodeType) -> Result<Arc<dyn NodeHandler>> {
        self.map
            .get(&node_type)
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("no handler for {node_type:?} nodes")))
    }
}

/// A named side-effect invoked by service nodes. Returns variable
/// updates to merge into the process.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<Variables>;
}

/// Process-wide registry of service handlers, initialized once and
/// looked up by the names in `node.handlers`. Unknown names are a
/// validation error at template-validation time, not at node entry.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: std::sync::RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        self.handlers.write().unwrap().insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.read().unwrap().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().unwrap().contains_key(name)
    }
}

/// Due time for a node's tasks: `start + timeout_duration`, rolled
/// forward off weekends when the node is working-day scoped.
pub fn compute_due_time(start: DateTime<Utc>, node: &NodeInstance) -> Option<DateTime<Utc>> {
    let ms = node.timeout_duration_ms?;
    let mut due = start + chrono::Duration::milliseconds(ms as i64);
    if node.is_working_day {
        while matches!(due.weekday(), Weekday::Sat | Weekday::Sun) {
            due += chrono::Duration::days(1);
        }
    }
    Some(due)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn node_with_timeout(ms: Option<u64>, working_day: bool) -> NodeInstance {
        let mut n = NodeInstance::from_config(
            uuid::Uuid::now_v7(),
            &crate::types::NodeConfig {
                node_key: "n".into(),
                name: "n".into(),
                node_type: NodeType::Approval,
                prev_nodes: vec![],
                next_nodes: vec![],
                parallel_nodes: vec![],
                branch_nodes: vec![],
                conditions: vec![],
                default_branch: None,
                assignees: vec![],
                candidates: vec![],
                countersign: Default::default(),
                assignee_strategy: Default::default(),
                continue_on_reject: false,
                properties: serde_json::Value::Null,
                handlers: vec![],
                retry_times: 0,
                retry_interval_ms: 0,
                is_working_day: working_day,
                timeout_duration_ms: ms,
                timeout_strategy: Default::default(),
            },
        );
        n.status = crate::types::NodeStatus::Active;
        n
    }

    #[test]
    fn no_timeout_means_no_due_time() {
        let node = node_with_timeout(None, false);
        assert_eq!(compute_due_time(Utc::now(), &node), None);
    }

    #[test]
    fn working_day_due_skips_weekend() {
        // Friday 2026-01-02 23:00 UTC + 4h lands on Saturday.
        let start = Utc.with_ymd_and_hms(2026, 1, 2, 23, 0, 0).unwrap();
        let node = node_with_timeout(Some(4 * 3600 * 1000), true);
        let due = compute_due_time(start, &node).unwrap();
        assert_eq!(due.weekday(), Weekday::Mon);

        let plain = node_with_timeout(Some(4 * 3600 * 1000), false);
        let due = compute_due_time(start, &plain).unwrap();
        assert_eq!(due.weekday(), Weekday::Sat);
    }

    #[test]
    fn registry_covers_all_node_types() {
        let registry = HandlerRegistry::standard();
        for t in [
            NodeType::Start,
            NodeType::Approval,
            NodeType::Service,
            NodeType::Exclusive,
            NodeType::Parallel,
            NodeType::Cc,
            NodeType::End,
        ] {
            assert!(registry.get(t).is_ok());
        }
    }
}
