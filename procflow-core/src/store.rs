//! Abstract persistence the engine consumes.
//!
//! The engine operates exclusively through this trait, enabling
//! pluggable backends (in-memory for tests/POC, a database in
//! production). The engine exclusively owns process/node/task mutation;
//! templates, rules and delegations are read-only to it; history is
//! append-only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::*;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // ── Templates (read-mostly; version flips are design-time ops) ──

    async fn save_template(&self, template: &Template) -> Result<()>;
    async fn get_template(&self, id: Uuid) -> Result<Option<Template>>;
    /// The single `is_latest` version for a code, if any.
    async fn latest_template(&self, code: &str) -> Result<Option<Template>>;
    /// Atomically make `version` the latest for `code`, clearing the
    /// previous latest flag.
    async fn set_latest_version(&self, code: &str, version: u32) -> Result<()>;

    // ── Processes ──

    async fn save_process(&self, process: &ProcessInstance) -> Result<()>;
    async fn get_process(&self, id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn find_process_by_business_key(
        &self,
        template_id: Uuid,
        business_key: &str,
    ) -> Result<Option<ProcessInstance>>;
    async fn list_active_processes(&self) -> Result<Vec<ProcessInstance>>;

    // ── Nodes ──

    async fn save_node(&self, node: &NodeInstance) -> Result<()>;
    async fn get_node(&self, process_id: Uuid, node_key: &str) -> Result<Option<NodeInstance>>;
    async fn list_nodes(&self, process_id: Uuid) -> Result<Vec<NodeInstance>>;

    // ── Parallel-join barriers ──

    /// Record one branch arrival at a join node. Returns the new count.
    async fn join_arrive(&self, process_id: Uuid, node_key: &str) -> Result<u32>;
    async fn join_reset(&self, process_id: Uuid, node_key: &str) -> Result<()>;

    // ── Tasks ──

    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;
    async fn list_tasks_for_node(&self, process_id: Uuid, node_key: &str) -> Result<Vec<Task>>;
    /// Non-terminal tasks of one process.
    async fn list_open_tasks(&self, process_id: Uuid) -> Result<Vec<Task>>;
    /// Non-terminal tasks across all processes with `due_time <= now`.
    async fn list_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;
    /// Non-terminal tasks with a due time, for the reminder sweep.
    async fn list_tasks_with_due_time(&self) -> Result<Vec<Task>>;

    // ── History (append-only) ──

    async fn append_history(&self, entry: &History) -> Result<()>;
    async fn list_history(&self, process_id: Uuid) -> Result<Vec<History>>;

    // ── Rules & delegations (read-only to the engine) ──

    /// Rules matching a template and/or node; unscoped rules match all.
    async fn list_rules(
        &self,
        template_id: Option<Uuid>,
        node_key: Option<&str>,
    ) -> Result<Vec<Rule>>;
    async fn list_delegations(&self, delegator_id: &str) -> Result<Vec<Delegation>>;
}
