//! Events published to the extension bus.
//!
//! Delivery is at-least-once; emission for a state transition happens
//! after the persistence commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{NodeType, ProcessInstance, ProcessStatus, Task, Variables};

/// Topic constants for everything the engine publishes.
pub mod topics {
    pub const PROCESS_STARTED: &str = "workflow.process.started";
    pub const PROCESS_COMPLETED: &str = "workflow.process.completed";
    pub const PROCESS_REJECTED: &str = "workflow.process.rejected";
    pub const PROCESS_CANCELLED: &str = "workflow.process.cancelled";
    pub const PROCESS_TERMINATED: &str = "workflow.process.terminated";
    pub const PROCESS_SUSPENDED: &str = "workflow.process.suspended";
    pub const PROCESS_RESUMED: &str = "workflow.process.resumed";
    pub const PROCESS_URGED: &str = "workflow.process.urged";
    pub const PROCESS_ERROR: &str = "workflow.process.error";

    pub const NODE_STARTED: &str = "workflow.node.started";
    pub const NODE_COMPLETED: &str = "workflow.node.completed";
    pub const NODE_REJECTED: &str = "workflow.node.rejected";

    pub const TASK_STARTED: &str = "workflow.task.started";
    pub const TASK_COMPLETED: &str = "workflow.task.completed";
    pub const TASK_REJECTED: &str = "workflow.task.rejected";
    pub const TASK_CANCELLED: &str = "workflow.task.cancelled";
    pub const TASK_WITHDRAWN: &str = "workflow.task.withdrawn";
    pub const TASK_DELEGATED: &str = "workflow.task.delegated";
    pub const TASK_TRANSFERRED: &str = "workflow.task.transferred";
    pub const TASK_CLAIMED: &str = "workflow.task.claimed";
    pub const TASK_URGED: &str = "workflow.task.urged";
    pub const TASK_OVERDUE: &str = "workflow.task.overdue";
    pub const TASK_REMINDER: &str = "workflow.task.reminder";

    pub const LEADER_ELECTED: &str = "workflow.leader.elected";
    pub const LEADER_LOST: &str = "workflow.leader.lost";
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventPayload {
    pub process_id: Option<Uuid>,
    pub node_key: Option<String>,
    pub task_id: Option<Uuid>,
    pub operator: Option<String>,
    pub action: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub module_code: Option<String>,
    pub form_code: Option<String>,
    pub template_id: Option<Uuid>,
    pub process_status: Option<ProcessStatus>,
    pub node_type: Option<NodeType>,
    pub variables: Option<Variables>,
    pub business_data: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub error_info: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineEvent {
    pub topic: String,
    pub payload: EventPayload,
}

impl EngineEvent {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            payload: EventPayload {
                timestamp: Some(Utc::now()),
                ..EventPayload::default()
            },
        }
    }

    /// Event scoped to a process instance.
    pub fn for_process(topic: &str, process: &ProcessInstance) -> Self {
        let mut ev = Self::new(topic);
        ev.payload.process_id = Some(process.id);
        ev.payload.template_id = Some(process.template_id);
        ev.payload.process_status = Some(process.status);
        ev.payload.business_data = Some(serde_json::Value::String(process.business_key.clone()));
        ev.payload.duration_ms = process
            .end_time
            .map(|end| (end - process.start_time).num_milliseconds());
        ev
    }

    /// Event scoped to a task.
    pub fn for_task(topic: &str, task: &Task) -> Self {
        let mut ev = Self::new(topic);
        ev.payload.process_id = Some(task.process_id);
        ev.payload.task_id = Some(task.id);
        ev.payload.node_key = Some(task.node_key.clone());
        ev.payload.node_type = Some(task.node_type);
        ev.payload.action = task.action.map(|a| a.as_str().to_string());
        ev
    }

    /// Event scoped to a node of a process.
    pub fn for_node(topic: &str, process_id: Uuid, node_key: &str, node_type: NodeType) -> Self {
        let mut ev = Self::new(topic);
        ev.payload.process_id = Some(process_id);
        ev.payload.node_key = Some(node_key.to_string());
        ev.payload.node_type = Some(node_type);
        ev
    }

    pub fn with_operator(mut self, operator: &str) -> Self {
        self.payload.operator = Some(operator.to_string());
        self
    }

    pub fn with_variables(mut self, variables: &Variables) -> Self {
        self.payload.variables = Some(variables.clone());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.payload.error_info = Some(error.into());
        self
    }
}

/// Extension-bus publication surface the engine consumes.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: EngineEvent) -> Result<()>;
}
