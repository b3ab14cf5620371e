//! The process engine: drives the process/node/task state machines.
//!
//! All mutation of one process (its nodes, tasks) happens while the
//! worker holds the distributed lock keyed on the process id; reads do
//! not take the lock. Events are emitted after the persistence commit.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batcher::{TaskBatcher, TaskSink};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::coordinator::{Coordinator, KvStore};
use crate::error::{EngineError, Result};
use crate::events::{topics, EngineEvent, EventBus};
use crate::handlers::{HandlerDeps, HandlerRegistry, Outcome, ServiceRegistry};
use crate::retry::{retry, RetryCallbacks};
use crate::rules;
use crate::store::WorkflowStore;
use crate::template;
use crate::types::*;

// ─── Requests / responses ─────────────────────────────────────

#[derive(Clone, Debug)]
pub struct StartProcessRequest {
    pub template_code: String,
    pub business_key: String,
    pub initiator: String,
    pub variables: Variables,
    pub priority: i32,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct StartProcessResponse {
    pub process_id: Uuid,
    pub process_key: String,
    pub status: ProcessStatus,
    pub start_time: DateTime<Utc>,
    pub variables: Variables,
}

#[derive(Clone, Debug)]
pub struct CompleteTaskRequest {
    pub task_id: Uuid,
    pub operator: String,
    pub action: TaskAction,
    pub comment: Option<String>,
    pub variables: Variables,
    pub form_data: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct CompleteTaskResponse {
    pub task_id: Uuid,
    pub task_status: TaskStatus,
    pub process_status: ProcessStatus,
}

// ─── Task creation sink ───────────────────────────────────────

/// The batcher's create path: persist each task, write its creation
/// history, and announce it.
struct TaskCreator {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn EventBus>,
}

#[async_trait]
impl TaskSink for TaskCreator {
    async fn create_tasks(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            self.store.save_task(task).await?;
            let mut entry = History::new(HistoryKind::Task, task.process_id, "task_created")
                .with_task(task.id)
                .with_node(&task.node_key);
            if let Some(from) = &task.delegated_from {
                entry = entry.with_details(format!("delegated_from={from}"));
            }
            self.store.append_history(&entry).await?;
            self.bus
                .publish(EngineEvent::for_task(topics::TASK_STARTED, task))
                .await?;
        }
        Ok(())
    }
}

// ─── Engine ───────────────────────────────────────────────────

/// Top-level facade wiring coordinator, batcher, handlers, rules and
/// the repository surface together. Created once in `init`, torn down
/// with `stop`.
pub struct ProcessEngine {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn EventBus>,
    coordinator: Coordinator,
    batcher: Arc<TaskBatcher>,
    handlers: HandlerRegistry,
    services: Arc<ServiceRegistry>,
    cfg: EngineConfig,
    root: CancellationToken,
    sweeps: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessEngine {
    /// Wire and start the engine: batcher workers, coordinator loops,
    /// and the leader-gated sweep loop.
    pub async fn init(
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn EventBus>,
        kv: Arc<dyn KvStore>,
        services: Arc<ServiceRegistry>,
        cfg: EngineConfig,
    ) -> Result<Arc<Self>> {
        let coordinator = Coordinator::new(kv, bus.clone(), cfg.coordinator.clone());
        coordinator.start().await?;

        let sink = Arc::new(TaskCreator {
            store: store.clone(),
            bus: bus.clone(),
        });
        let batcher = Arc::new(TaskBatcher::new(cfg.batcher.clone(), sink));
        batcher.start().await;

        let engine = Arc::new(Self {
            store,
            bus,
            coordinator,
            batcher,
            handlers: HandlerRegistry::standard(),
            services,
            cfg,
            root: CancellationToken::new(),
            sweeps: tokio::sync::Mutex::new(Vec::new()),
        });

        let sweeper = engine.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweeper.root.cancelled() => break,
                    _ = tokio::time::sleep(sweeper.cfg.sweep_interval) => {}
                }
                if !sweeper.coordinator.is_leader() {
                    continue;
                }
                if let Err(err) = sweeper.sweep_timeouts_once().await {
                    warn!(%err, "timeout sweep failed");
                }
                if let Err(err) = sweeper.sweep_reminders_once().await {
                    warn!(%err, "reminder sweep failed");
                }
            }
        });
        engine.sweeps.lock().await.push(handle);

        Ok(engine)
    }

    /// Clean shutdown: cancel the root scope, drain the batcher, then
    /// stop the coordinator (releasing locks and deregistering).
    pub async fn stop(&self) {
        self.root.cancel();
        for handle in self.sweeps.lock().await.drain(..) {
            let _ = handle.await;
        }
        self.batcher.stop().await;
        self.coordinator.stop().await;
    }

    pub fn is_leader(&self) -> bool {
        self.coordinator.is_leader()
    }

    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    fn deps(&self) -> HandlerDeps {
        HandlerDeps {
            store: self.store.clone(),
            bus: self.bus.clone(),
            batcher: self.batcher.clone(),
            services: self.services.clone(),
        }
    }

    // ── Read surface ──

    pub async fn process(&self, id: Uuid) -> Result<ProcessInstance> {
        self.store
            .get_process(id)
            .await?
            .ok_or_else(|| EngineError::not_found("process", id))
    }

    pub async fn task(&self, id: Uuid) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", id))
    }

    pub async fn histories(&self, process_id: Uuid) -> Result<Vec<History>> {
        self.store.list_history(process_id).await
    }

    pub async fn open_tasks(&self, process_id: Uuid) -> Result<Vec<Task>> {
        self.store.list_open_tasks(process_id).await
    }

    /// Validate a template version and fill its computed join
    /// identities; required before the version may become latest.
    pub fn validate_template(&self, template: &mut Template) -> Result<()> {
        template::prepare_template(template, &self.services)
    }

    // ── Locking ──

    fn lock_name(process_id: Uuid) -> String {
        format!("proc/{process_id}")
    }

    async fn lock_process(&self, ctx: &ExecutionContext, process_id: Uuid) -> Result<()> {
        let name = Self::lock_name(process_id);
        retry(
            ctx.token(),
            &self.cfg.persistence_retry,
            &RetryCallbacks::default(),
            |_| self.coordinator.acquire_lock(ctx.token(), &name),
        )
        .await
    }

    async fn unlock_process(&self, process_id: Uuid) {
        if let Err(err) = self.coordinator.release_lock(&Self::lock_name(process_id)).await {
            warn!(%process_id, %err, "failed to release process lock");
        }
    }

    async fn save_process(&self, ctx: &ExecutionContext, process: &ProcessInstance) -> Result<()> {
        retry(
            ctx.token(),
            &self.cfg.persistence_retry,
            &RetryCallbacks::default(),
            |_| self.store.save_process(process),
        )
        .await
    }

    // ── StartProcess ──

    pub async fn start_process(
        &self,
        ctx: &ExecutionContext,
        req: StartProcessRequest,
    ) -> Result<StartProcessResponse> {
        let now = Utc::now();
        let template = self
            .store
            .latest_template(&req.template_code)
            .await?
            .ok_or_else(|| EngineError::not_found("template", &req.template_code))?;
        if !template.is_startable(now) {
            return Err(EngineError::Validation(format!(
                "template {} is not startable (latest/enabled/effective)",
                template.code
            )));
        }
        if self.cfg.unique_business_key {
            if let Some(existing) = self
                .store
                .find_process_by_business_key(template.id, &req.business_key)
                .await?
            {
                if !existing.status.is_terminal() {
                    return Err(EngineError::Conflict(format!(
                        "process {} already running for business key {}",
                        existing.process_key, req.business_key
                    )));
                }
            }
        }

        let start_key = template
            .node_config
            .iter()
            .find(|n| n.node_type == NodeType::Start)
            .map(|n| n.node_key.clone())
            .ok_or_else(|| EngineError::Validation("template has no start node".into()))?;

        let process_id = Uuid::now_v7();
        let mut process = ProcessInstance {
            id: process_id,
            process_key: format!("proc-{process_id}"),
            template_id: template.id,
            business_key: req.business_key,
            initiator: req.initiator.clone(),
            variables: req.variables,
            current_node: None,
            active_nodes: Vec::new(),
            status: ProcessStatus::Pending,
            flow_status: FlowStatus::Pending,
            priority: req.priority,
            is_suspended: false,
            suspended_at: None,
            urge_count: 0,
            start_time: now,
            end_time: None,
            due_date: req.due_date,
            parent_id: None,
        };
        self.save_process(ctx, &process).await?;

        self.lock_process(ctx, process_id).await?;
        let started = self.start_locked(ctx, &mut process, &template, &start_key).await;
        self.unlock_process(process_id).await;

        match started {
            Ok(()) if process.status == ProcessStatus::Error => {
                // A handler pushed the process into error during the
                // first traversal; the instance is already persisted
                // and annotated, surface the failure to the caller.
                Err(EngineError::Fatal(format!(
                    "process {} entered error state during start",
                    process.process_key
                )))
            }
            Ok(()) => {
                info!(%process_id, template = %template.code, "process started");
                self.bus
                    .publish(
                        EngineEvent::for_process(topics::PROCESS_STARTED, &process)
                            .with_operator(&req.initiator)
                            .with_variables(&process.variables),
                    )
                    .await?;
                Ok(StartProcessResponse {
                    process_id,
                    process_key: process.process_key.clone(),
                    status: process.status,
                    start_time: process.start_time,
                    variables: process.variables,
                })
            }
            Err(err) => {
                self.fail_process(ctx, &mut process, &err).await?;
                Err(err)
            }
        }
    }

    async fn start_locked(
        &self,
        ctx: &ExecutionContext,
        process: &mut ProcessInstance,
        template: &Template,
        start_key: &str,
    ) -> Result<()> {
        // Instantiate node records by copying the template's node config.
        for cfg in &template.node_config {
            let node = NodeInstance::from_config(process.id, cfg);
            self.store.save_node(&node).await?;
        }

        process.status = ProcessStatus::Active;
        process.flow_status = FlowStatus::InProgress;
        process.current_node = Some(start_key.to_string());
        self.save_process(ctx, process).await?;
        self.store
            .append_history(
                &History::new(HistoryKind::Process, process.id, "process_started")
                    .with_operator(&process.initiator),
            )
            .await?;

        self.traverse(ctx, process, vec![start_key.to_string()]).await
    }

    // ── Node traversal ──

    /// Outer traversal boundary: seed the context's working variable
    /// store from the process, run the cascade, then write the store
    /// back and persist. Handlers read and write variables through
    /// the context only, which is what lets parallel branches run
    /// against isolated copies.
    async fn traverse(
        &self,
        ctx: &ExecutionContext,
        process: &mut ProcessInstance,
        initial: Vec<String>,
    ) -> Result<()> {
        ctx.merge_variables(&process.variables);
        let result = self.run_from(ctx, process, initial).await;
        process.variables = ctx.variables();
        self.save_process(ctx, process).await?;
        result
    }

    /// Activate each node on the worklist, apply handler outcomes, and
    /// cascade until the process parks on tasks or terminates. The
    /// context must already carry the working variables (see
    /// [`ProcessEngine::traverse`]).
    fn run_from<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        process: &'a mut ProcessInstance,
        initial: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        let deps = self.deps();
        let mut worklist: VecDeque<String> = initial.into();

        while let Some(node_key) = worklist.pop_front() {
            if process.status.is_terminal() {
                break;
            }
            if ctx.token().is_cancelled() {
                return Err(EngineError::Cancelled("node traversal".into()));
            }

            let mut node = self
                .store
                .get_node(process.id, &node_key)
                .await?
                .ok_or_else(|| EngineError::Fatal(format!("node {node_key} missing")))?;

            node.status = NodeStatus::Active;
            node.entered_at = Some(Utc::now());
            self.store.save_node(&node).await?;
            self.store
                .append_history(
                    &History::new(HistoryKind::Node, process.id, "node_started")
                        .with_node(&node_key),
                )
                .await?;
            self.bus
                .publish(EngineEvent::for_node(
                    topics::NODE_STARTED,
                    process.id,
                    &node_key,
                    node.node_type,
                ))
                .await?;
            process.current_node = Some(node_key.clone());
            if !process.active_nodes.contains(&node_key) {
                process.active_nodes.push(node_key.clone());
            }

            // Rules scoped to this node fire on entry.
            self.apply_node_rules(ctx, process, &node_key).await?;

            let handler = self.handlers.get(node.node_type)?;
            let outcome = handler.enter(ctx, &deps, process, &mut node).await?;
            self.apply_outcome(ctx, process, &mut node, outcome, &mut worklist)
                .await?;
        }

        Ok(())
        })
    }

    async fn apply_outcome(
        &self,
        ctx: &ExecutionContext,
        process: &mut ProcessInstance,
        node: &mut NodeInstance,
        outcome: Outcome,
        worklist: &mut VecDeque<String>,
    ) -> Result<()> {
        match outcome {
            Outcome::Remain => {
                // End nodes mark the process terminal from `enter`.
                if process.status.is_terminal() {
                    node.status = NodeStatus::Completed;
                    node.completed_at = Some(Utc::now());
                    self.store.save_node(node).await?;
                    process.active_nodes.retain(|k| k != &node.node_key);
                    self.finalize_process(ctx, process, topics::PROCESS_COMPLETED, None)
                        .await?;
                }
                Ok(())
            }

            Outcome::Advance(targets) => {
                node.status = NodeStatus::Completed;
                node.completed_at = Some(Utc::now());
                self.store.save_node(node).await?;
                process.active_nodes.retain(|k| k != &node.node_key);
                self.bus
                    .publish(EngineEvent::for_node(
                        topics::NODE_COMPLETED,
                        process.id,
                        &node.node_key,
                        node.node_type,
                    ))
                    .await?;

                let mut open_targets = Vec::new();
                for target in targets {
                    if self.join_gate(process, &target).await? {
                        open_targets.push(target);
                    } else {
                        debug!(node_key = %target, "join barrier holding branch");
                    }
                }

                if node.node_type == NodeType::Parallel && open_targets.len() > 1 {
                    // Forked branches must not see each other's
                    // variable writes.
                    self.run_parallel_branches(ctx, process, open_targets)
                        .await?;
                } else {
                    worklist.extend(open_targets);
                }
                Ok(())
            }

            Outcome::Reject => {
                node.status = NodeStatus::Rejected;
                node.completed_at = Some(Utc::now());
                self.store.save_node(node).await?;
                process.active_nodes.retain(|k| k != &node.node_key);
                self.bus
                    .publish(EngineEvent::for_node(
                        topics::NODE_REJECTED,
                        process.id,
                        &node.node_key,
                        node.node_type,
                    ))
                    .await?;

                process.status = ProcessStatus::Rejected;
                process.flow_status = FlowStatus::Rejected;
                self.finalize_process(ctx, process, topics::PROCESS_REJECTED, None)
                    .await
            }

            Outcome::Suspend => {
                process.status = ProcessStatus::Suspended;
                process.is_suspended = true;
                self.save_process(ctx, process).await?;
                self.bus
                    .publish(EngineEvent::for_process(topics::PROCESS_SUSPENDED, process))
                    .await?;
                Ok(())
            }

            Outcome::Error(err) => {
                node.status = NodeStatus::Error;
                self.store.save_node(node).await?;
                self.fail_process(ctx, process, &err).await
            }
        }
    }

    /// True when `target` may be entered now. A join node (registered
    /// in some parallel fork's `branch_nodes`) opens only when every
    /// forked branch has arrived.
    async fn join_gate(&self, process: &ProcessInstance, target: &str) -> Result<bool> {
        let nodes = self.store.list_nodes(process.id).await?;
        let fork = nodes.iter().find(|n| {
            n.node_type == NodeType::Parallel && n.branch_nodes.iter().any(|b| b == target)
        });
        let Some(fork) = fork else {
            return Ok(true);
        };
        let expected = fork.next_nodes.len() as u32;
        let arrived = self.store.join_arrive(process.id, target).await?;
        debug!(join = target, arrived, expected, "join arrival");
        Ok(arrived >= expected)
    }

    /// Run forked branches sequentially under the process lock, each
    /// against its own branch context so one branch's variable writes
    /// are invisible to its siblings. Every branch is cloned from the
    /// fork-point snapshot before any of them runs; afterwards each
    /// branch's writes merge back into the forking context (last
    /// writer wins on conflicting keys).
    async fn run_parallel_branches(
        &self,
        ctx: &ExecutionContext,
        process: &mut ProcessInstance,
        targets: Vec<String>,
    ) -> Result<()> {
        let base = ctx.variables();
        let branch_ctxs: Vec<ExecutionContext> =
            targets.iter().map(|_| ctx.clone_branch()).collect();

        for (target, branch_ctx) in targets.into_iter().zip(branch_ctxs.iter()) {
            // Boxed: the branch cascade may fork again.
            self.run_from(branch_ctx, process, vec![target]).await?;
            if process.status.is_terminal() {
                break;
            }
        }

        for branch_ctx in &branch_ctxs {
            for (key, value) in branch_ctx.variables() {
                if base.get(&key) != Some(&value) {
                    ctx.set_variable(key, value);
                }
            }
        }
        Ok(())
    }

    // ── Terminal transitions ──

    /// Cancel open tasks, clear `active_nodes`, stamp `end_time`,
    /// persist, record history, and announce. The caller has already
    /// set the terminal status.
    async fn finalize_process(
        &self,
        ctx: &ExecutionContext,
        process: &mut ProcessInstance,
        topic: &str,
        detail: Option<String>,
    ) -> Result<()> {
        for mut task in self.store.list_open_tasks(process.id).await? {
            task.status = TaskStatus::Cancelled;
            task.action = Some(TaskAction::Cancel);
            task.end_time = Some(Utc::now());
            self.store.save_task(&task).await?;
            self.bus
                .publish(EngineEvent::for_task(topics::TASK_CANCELLED, &task))
                .await?;
        }

        process.active_nodes.clear();
        if process.end_time.is_none() {
            process.end_time = Some(Utc::now());
        }
        self.save_process(ctx, process).await?;

        let mut entry = History::new(
            HistoryKind::Process,
            process.id,
            format!("process_{:?}", process.status).to_lowercase(),
        );
        if let Some(detail) = detail {
            entry = entry.with_details(detail);
        }
        self.store.append_history(&entry).await?;

        info!(process_id = %process.id, status = ?process.status, "process finished");
        self.bus
            .publish(EngineEvent::for_process(topic, process))
            .await?;
        Ok(())
    }

    /// Persistent failure: the process moves to `error` and is left for
    /// operator intervention; committed state is not rolled back.
    async fn fail_process(
        &self,
        ctx: &ExecutionContext,
        process: &mut ProcessInstance,
        err: &EngineError,
    ) -> Result<()> {
        error!(process_id = %process.id, %err, "process failed");
        process.status = ProcessStatus::Error;
        process.flow_status = FlowStatus::Error;
        process.active_nodes.clear();
        if process.end_time.is_none() {
            process.end_time = Some(Utc::now());
        }
        self.save_process(ctx, process).await?;
        self.store
            .append_history(
                &History::new(HistoryKind::Process, process.id, "process_error")
                    .with_details(err.to_string()),
            )
            .await?;
        self.bus
            .publish(EngineEvent::for_process(topics::PROCESS_ERROR, process).with_error(err.to_string()))
            .await?;
        Ok(())
    }

    // ── CompleteTask ──

    pub async fn complete_task(
        &self,
        ctx: &ExecutionContext,
        req: CompleteTaskRequest,
    ) -> Result<CompleteTaskResponse> {
        let task = self.task(req.task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::already_terminal("task"));
        }
        // Assignee check happens before lock acquisition so bad input
        // cannot amplify lock contention.
        if !task.is_assignee(&req.operator) {
            return Err(EngineError::assignee_mismatch(&req.operator));
        }

        self.lock_process(ctx, task.process_id).await?;
        let result = self.complete_task_locked(ctx, &req).await;
        self.unlock_process(task.process_id).await;
        result
    }

    async fn complete_task_locked(
        &self,
        ctx: &ExecutionContext,
        req: &CompleteTaskRequest,
    ) -> Result<CompleteTaskResponse> {
        // Reload under the lock: the task may have been resolved by a
        // competing operation between check and lock.
        let mut task = self.task(req.task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::already_terminal("task"));
        }
        let mut process = self.process(task.process_id).await?;
        if process.is_suspended {
            return Err(EngineError::Conflict("process is suspended".into()));
        }
        if process.status.is_terminal() {
            return Err(EngineError::already_terminal("process"));
        }

        task.status = match req.action {
            TaskAction::Reject | TaskAction::AutoFail => TaskStatus::Rejected,
            _ => TaskStatus::Completed,
        };
        task.action = Some(req.action);
        task.comment = req.comment.clone();
        if !req.form_data.is_null() {
            task.form_data = req.form_data.clone();
        }
        for (k, v) in &req.variables {
            task.variables.insert(k.clone(), v.clone());
        }
        task.end_time = Some(Utc::now());
        self.store.save_task(&task).await?;

        let mut entry = History::new(HistoryKind::Task, process.id, "task_completed")
            .with_task(task.id)
            .with_node(&task.node_key)
            .with_operator(&req.operator)
            .with_comment(req.comment.as_deref());
        entry.variables = req.variables.clone();
        entry.details = Some(format!("action={}", req.action.as_str()));
        self.store.append_history(&entry).await?;

        let topic = match task.status {
            TaskStatus::Rejected => topics::TASK_REJECTED,
            _ => topics::TASK_COMPLETED,
        };
        self.bus
            .publish(EngineEvent::for_task(topic, &task).with_operator(&req.operator))
            .await?;

        // Task variables feed the process before rules and branches run.
        for (k, v) in &req.variables {
            process.variables.insert(k.clone(), v.clone());
        }

        self.resolve_task_against_node(ctx, &mut process, &task).await?;

        Ok(CompleteTaskResponse {
            task_id: task.id,
            task_status: task.status,
            process_status: process.status,
        })
    }

    /// Hand a resolved task to its node handler and apply the outcome.
    async fn resolve_task_against_node(
        &self,
        ctx: &ExecutionContext,
        process: &mut ProcessInstance,
        task: &Task,
    ) -> Result<()> {
        let deps = self.deps();
        let mut node = self
            .store
            .get_node(process.id, &task.node_key)
            .await?
            .ok_or_else(|| EngineError::Fatal(format!("node {} missing", task.node_key)))?;

        let handler = self.handlers.get(node.node_type)?;
        let outcome = handler
            .on_task_resolved(ctx, &deps, process, &mut node, task)
            .await?;

        ctx.merge_variables(&process.variables);
        let mut worklist = VecDeque::new();
        self.apply_outcome(ctx, process, &mut node, outcome, &mut worklist)
            .await?;
        let targets: Vec<String> = worklist.into_iter().collect();
        let result = self.run_from(ctx, process, targets).await;
        process.variables = ctx.variables();
        self.save_process(ctx, process).await?;
        result
    }

    // ── Delegate / Transfer / Withdraw / Urge / Claim ──

    pub async fn delegate_task(
        &self,
        ctx: &ExecutionContext,
        task_id: Uuid,
        operator: &str,
        delegatee: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        let task = self.task(task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::already_terminal("task"));
        }
        if !task.is_assignee(operator) {
            return Err(EngineError::assignee_mismatch(operator));
        }
        let process = self.process(task.process_id).await?;
        let template = self.template_of(&process).await?;
        if !template.allow_delegate {
            return Err(EngineError::Permission(format!(
                "template {} forbids delegation",
                template.code
            )));
        }

        self.lock_process(ctx, task.process_id).await?;
        let result = async {
            let mut task = self.task(task_id).await?;
            if task.status.is_terminal() {
                return Err(EngineError::already_terminal("task"));
            }
            task.assignees = vec![delegatee.to_string()];
            task.is_delegated = true;
            task.delegated_from = Some(operator.to_string());
            self.store.save_task(&task).await?;
            self.store
                .append_history(
                    &History::new(HistoryKind::Task, task.process_id, "task_delegated")
                        .with_task(task.id)
                        .with_node(&task.node_key)
                        .with_operator(operator)
                        .with_comment(comment)
                        .with_details(format!("delegatee={delegatee}")),
                )
                .await?;
            self.bus
                .publish(EngineEvent::for_task(topics::TASK_DELEGATED, &task).with_operator(operator))
                .await?;
            Ok(())
        }
        .await;
        self.unlock_process(task.process_id).await;
        result
    }

    pub async fn transfer_task(
        &self,
        ctx: &ExecutionContext,
        task_id: Uuid,
        operator: &str,
        transferee: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        let task = self.task(task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::already_terminal("task"));
        }
        if !task.is_assignee(operator) {
            return Err(EngineError::assignee_mismatch(operator));
        }
        let process = self.process(task.process_id).await?;
        let template = self.template_of(&process).await?;
        if !template.allow_transfer {
            return Err(EngineError::Permission(format!(
                "template {} forbids transfer",
                template.code
            )));
        }

        self.lock_process(ctx, task.process_id).await?;
        let result = async {
            let mut task = self.task(task_id).await?;
            if task.status.is_terminal() {
                return Err(EngineError::already_terminal("task"));
            }
            task.assignees = vec![transferee.to_string()];
            task.is_transferred = true;
            task.transferred_from = Some(operator.to_string());
            self.store.save_task(&task).await?;
            self.store
                .append_history(
                    &History::new(HistoryKind::Task, task.process_id, "task_transferred")
                        .with_task(task.id)
                        .with_node(&task.node_key)
                        .with_operator(operator)
                        .with_comment(comment)
                        .with_details(format!("transferee={transferee}")),
                )
                .await?;
            self.bus
                .publish(
                    EngineEvent::for_task(topics::TASK_TRANSFERRED, &task).with_operator(operator),
                )
                .await?;
            Ok(())
        }
        .await;
        self.unlock_process(task.process_id).await;
        result
    }

    /// Revoke a live task and reissue it as a resubmit: the old record
    /// goes `withdrawn` (terminal), a fresh pending task linked through
    /// `parent_id`/`child_ids` takes its place.
    pub async fn withdraw_task(
        &self,
        ctx: &ExecutionContext,
        task_id: Uuid,
        operator: &str,
    ) -> Result<Uuid> {
        let task = self.task(task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::already_terminal("task"));
        }
        let process = self.process(task.process_id).await?;
        if process.initiator != operator {
            return Err(EngineError::Permission(format!(
                "only the initiator may withdraw (got {operator})"
            )));
        }

        self.lock_process(ctx, task.process_id).await?;
        let result = async {
            let mut task = self.task(task_id).await?;
            if task.status.is_terminal() {
                return Err(EngineError::already_terminal("task"));
            }
            let node = self
                .store
                .get_node(task.process_id, &task.node_key)
                .await?
                .ok_or_else(|| EngineError::Fatal(format!("node {} missing", task.node_key)))?;

            task.status = TaskStatus::Withdrawn;
            task.action = Some(TaskAction::Withdraw);
            task.end_time = Some(Utc::now());

            let mut resubmit = Task::new(task.process_id, &node, task.assignees.clone());
            resubmit.candidates = task.candidates.clone();
            resubmit.is_resubmit = true;
            resubmit.parent_id = Some(task.id);
            resubmit.due_time = crate::handlers::compute_due_time(resubmit.start_time, &node);
            let resubmit_id = resubmit.id;
            task.child_ids.push(resubmit_id);

            self.store.save_task(&task).await?;
            self.batcher
                .add_sync(ctx.token(), resubmit, process.priority)
                .await?;

            self.store
                .append_history(
                    &History::new(HistoryKind::Task, task.process_id, "task_withdrawn")
                        .with_task(task.id)
                        .with_node(&task.node_key)
                        .with_operator(operator)
                        .with_details(format!("resubmit={resubmit_id}")),
                )
                .await?;
            self.bus
                .publish(EngineEvent::for_task(topics::TASK_WITHDRAWN, &task).with_operator(operator))
                .await?;
            Ok(resubmit_id)
        }
        .await;
        self.unlock_process(task.process_id).await;
        result
    }

    pub async fn urge_task(
        &self,
        ctx: &ExecutionContext,
        task_id: Uuid,
        operator: &str,
    ) -> Result<()> {
        let task = self.task(task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::already_terminal("task"));
        }
        let process = self.process(task.process_id).await?;
        if process.initiator != operator {
            return Err(EngineError::Permission(format!(
                "only the initiator may urge (got {operator})"
            )));
        }
        let template = self.template_of(&process).await?;
        if !template.allow_urge {
            return Err(EngineError::Permission(format!(
                "template {} forbids urging",
                template.code
            )));
        }
        let quota = template.timeout_config.urge_quota;
        if quota > 0 && task.urge_count >= quota {
            return Err(EngineError::Conflict(format!(
                "urge quota {quota} exhausted for task {task_id}"
            )));
        }

        self.lock_process(ctx, task.process_id).await?;
        let result = async {
            let mut task = self.task(task_id).await?;
            if task.status.is_terminal() {
                return Err(EngineError::already_terminal("task"));
            }
            // Monotonic by construction: only ever incremented.
            task.urge_count += 1;
            task.is_urged = true;
            self.store.save_task(&task).await?;

            let mut process = self.process(task.process_id).await?;
            process.urge_count += 1;
            self.save_process(ctx, &process).await?;

            self.store
                .append_history(
                    &History::new(HistoryKind::Task, task.process_id, "task_urged")
                        .with_task(task.id)
                        .with_node(&task.node_key)
                        .with_operator(operator)
                        .with_details(format!("urge_count={}", task.urge_count)),
                )
                .await?;
            self.bus
                .publish(EngineEvent::for_task(topics::TASK_URGED, &task).with_operator(operator))
                .await?;
            Ok(())
        }
        .await;
        self.unlock_process(task.process_id).await;
        result
    }

    pub async fn claim_task(
        &self,
        ctx: &ExecutionContext,
        task_id: Uuid,
        operator: &str,
    ) -> Result<()> {
        let task = self.task(task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::already_terminal("task"));
        }
        if !task.assignees.is_empty() {
            return Err(EngineError::Conflict("task is already assigned".into()));
        }
        if !task.candidates.iter().any(|c| c == operator) {
            return Err(EngineError::Permission(format!(
                "{operator} is not a candidate for task {task_id}"
            )));
        }

        self.lock_process(ctx, task.process_id).await?;
        let result = async {
            let mut task = self.task(task_id).await?;
            if task.status.is_terminal() {
                return Err(EngineError::already_terminal("task"));
            }
            if !task.assignees.is_empty() {
                return Err(EngineError::Conflict("task is already assigned".into()));
            }
            task.assignees = vec![operator.to_string()];
            task.claim_time = Some(Utc::now());
            task.status = TaskStatus::Processing;
            self.store.save_task(&task).await?;
            self.store
                .append_history(
                    &History::new(HistoryKind::Task, task.process_id, "task_claimed")
                        .with_task(task.id)
                        .with_node(&task.node_key)
                        .with_operator(operator),
                )
                .await?;
            self.bus
                .publish(EngineEvent::for_task(topics::TASK_CLAIMED, &task).with_operator(operator))
                .await?;
            Ok(())
        }
        .await;
        self.unlock_process(task.process_id).await;
        result
    }

    // ── Terminate / Suspend / Resume / Cancel ──

    /// Leader-gated: force the process to `terminated`, cancelling all
    /// open tasks.
    pub async fn terminate(
        &self,
        ctx: &ExecutionContext,
        process_id: Uuid,
        operator: &str,
        reason: &str,
    ) -> Result<()> {
        self.require_leader("terminate")?;
        let mut process = self.process(process_id).await?;
        if process.status.is_terminal() {
            return Err(EngineError::already_terminal("process"));
        }

        self.lock_process(ctx, process_id).await?;
        let result = async {
            process.status = ProcessStatus::Terminated;
            process.flow_status = FlowStatus::Terminated;
            self.finalize_process(
                ctx,
                &mut process,
                topics::PROCESS_TERMINATED,
                Some(format!("operator={operator} reason={reason}")),
            )
            .await
        }
        .await;
        self.unlock_process(process_id).await;
        result
    }

    /// Leader-gated: halt timers, keep state. Task creation is refused
    /// while suspended.
    pub async fn suspend(&self, ctx: &ExecutionContext, process_id: Uuid) -> Result<()> {
        self.require_leader("suspend")?;
        self.lock_process(ctx, process_id).await?;
        let result = async {
            let mut process = self.process(process_id).await?;
            if process.status != ProcessStatus::Active {
                return Err(EngineError::Conflict(format!(
                    "only active processes can be suspended (status {:?})",
                    process.status
                )));
            }
            process.status = ProcessStatus::Suspended;
            process.is_suspended = true;
            process.suspended_at = Some(Utc::now());
            self.save_process(ctx, &process).await?;
            self.store
                .append_history(
                    &History::new(HistoryKind::Process, process_id, "process_suspended"),
                )
                .await?;
            self.bus
                .publish(EngineEvent::for_process(topics::PROCESS_SUSPENDED, &process))
                .await?;
            Ok(())
        }
        .await;
        self.unlock_process(process_id).await;
        result
    }

    /// Leader-gated: clear suspension and re-arm timers.
    pub async fn resume(&self, ctx: &ExecutionContext, process_id: Uuid) -> Result<()> {
        self.require_leader("resume")?;
        self.lock_process(ctx, process_id).await?;
        let result = async {
            let mut process = self.process(process_id).await?;
            if process.status != ProcessStatus::Suspended {
                return Err(EngineError::Conflict(format!(
                    "process is not suspended (status {:?})",
                    process.status
                )));
            }

            // Re-arm timers: the suspension window must not consume
            // any task's remaining timeout budget, so open due times
            // (and reminder bookkeeping) shift by the elapsed pause.
            let suspended_for = process
                .suspended_at
                .map(|since| Utc::now() - since)
                .unwrap_or_else(chrono::Duration::zero);
            for mut task in self.store.list_open_tasks(process_id).await? {
                if let Some(due) = task.due_time {
                    task.due_time = Some(due + suspended_for);
                    if let Some(reminded) = task.reminded_at {
                        task.reminded_at = Some(reminded + suspended_for);
                    }
                    self.store.save_task(&task).await?;
                }
            }

            process.status = ProcessStatus::Active;
            process.is_suspended = false;
            process.suspended_at = None;
            self.save_process(ctx, &process).await?;
            self.store
                .append_history(
                    &History::new(HistoryKind::Process, process_id, "process_resumed")
                        .with_details(format!(
                            "suspended_ms={}",
                            suspended_for.num_milliseconds()
                        )),
                )
                .await?;
            self.bus
                .publish(EngineEvent::for_process(topics::PROCESS_RESUMED, &process))
                .await?;
            Ok(())
        }
        .await;
        self.unlock_process(process_id).await;
        result
    }

    /// Initiator-requested cancellation, gated by `allow_cancel`.
    pub async fn cancel_process(
        &self,
        ctx: &ExecutionContext,
        process_id: Uuid,
        operator: &str,
        reason: &str,
    ) -> Result<()> {
        let process = self.process(process_id).await?;
        if process.status.is_terminal() {
            return Err(EngineError::already_terminal("process"));
        }
        if process.initiator != operator {
            return Err(EngineError::Permission(format!(
                "only the initiator may cancel (got {operator})"
            )));
        }
        let template = self.template_of(&process).await?;
        if !template.allow_cancel {
            return Err(EngineError::Permission(format!(
                "template {} forbids cancellation",
                template.code
            )));
        }

        self.lock_process(ctx, process_id).await?;
        let result = async {
            let mut process = self.process(process_id).await?;
            if process.status.is_terminal() {
                return Err(EngineError::already_terminal("process"));
            }
            process.status = ProcessStatus::Cancelled;
            process.flow_status = FlowStatus::Cancelled;
            self.finalize_process(
                ctx,
                &mut process,
                topics::PROCESS_CANCELLED,
                Some(format!("operator={operator} reason={reason}")),
            )
            .await
        }
        .await;
        self.unlock_process(process_id).await;
        result
    }

    fn require_leader(&self, op: &str) -> Result<()> {
        if self.coordinator.is_leader() {
            Ok(())
        } else {
            Err(EngineError::Conflict(format!(
                "{op} is leader-gated and this node is not the leader"
            )))
        }
    }

    // ── Rules ──

    fn rule_data(process: &ProcessInstance, variables: &Variables) -> serde_json::Value {
        serde_json::json!({
            "variables": serde_json::Value::Object(variables.clone()),
            "business_key": process.business_key,
            "initiator": process.initiator,
            "status": process.status,
            "priority": process.priority,
        })
    }

    /// Apply a rule outcome's side effects and return its variable
    /// writes for the caller to merge into the working store.
    async fn apply_rule_actions(
        &self,
        process: &ProcessInstance,
        outcome: &rules::RuleOutcome,
    ) -> Result<Variables> {
        let mut writes = Variables::new();
        for action in &outcome.actions {
            match action.action_type.as_str() {
                "set_variable" => {
                    if let Some(target) = &action.target {
                        writes.insert(target.clone(), action.params.clone());
                    }
                }
                "emit_event" => {
                    if let Some(topic) = &action.target {
                        self.bus
                            .publish(EngineEvent::for_process(topic, process))
                            .await?;
                    }
                }
                other => {
                    // Unknown action types are recorded, not guessed at.
                    self.store
                        .append_history(
                            &History::new(HistoryKind::Process, process.id, "rule_action")
                                .with_details(format!(
                                    "type={other} target={:?}",
                                    action.target
                                )),
                        )
                        .await?;
                }
            }
        }
        Ok(writes)
    }

    async fn apply_node_rules(
        &self,
        ctx: &ExecutionContext,
        process: &ProcessInstance,
        node_key: &str,
    ) -> Result<()> {
        let matching = self
            .store
            .list_rules(Some(process.template_id), Some(node_key))
            .await?;
        if matching.is_empty() {
            return Ok(());
        }
        let vars = ctx.variables();
        let outcome = rules::evaluate_rules(&matching, &Self::rule_data(process, &vars), Utc::now());
        let writes = self.apply_rule_actions(process, &outcome).await?;
        ctx.merge_variables(&writes);
        Ok(())
    }

    /// Explicit rule evaluation over a process (template-scoped rules
    /// plus rules scoped to its active nodes).
    pub async fn evaluate_rules(
        &self,
        ctx: &ExecutionContext,
        process_id: Uuid,
    ) -> Result<rules::RuleOutcome> {
        self.lock_process(ctx, process_id).await?;
        let result = async {
            let mut process = self.process(process_id).await?;
            let mut matching = self
                .store
                .list_rules(Some(process.template_id), None)
                .await?;
            for node_key in process.active_nodes.clone() {
                let scoped = self
                    .store
                    .list_rules(Some(process.template_id), Some(&node_key))
                    .await?;
                for rule in scoped {
                    if !matching.iter().any(|r| r.id == rule.id) {
                        matching.push(rule);
                    }
                }
            }
            let outcome = rules::evaluate_rules(
                &matching,
                &Self::rule_data(&process, &process.variables),
                Utc::now(),
            );
            let writes = self.apply_rule_actions(&process, &outcome).await?;
            for (key, value) in writes {
                process.variables.insert(key, value);
            }
            self.save_process(ctx, &process).await?;
            Ok(outcome)
        }
        .await;
        self.unlock_process(process_id).await;
        result
    }

    // ── Leader sweeps ──

    /// One timeout sweep pass. Leader-only; non-leaders return without
    /// scanning, and a worker failure loses nothing because the sweep
    /// re-fires on the next leader scan.
    pub async fn sweep_timeouts_once(&self) -> Result<()> {
        if !self.coordinator.is_leader() {
            return Ok(());
        }
        let ctx = ExecutionContext::for_operator(self.root.child_token(), "system");
        let now = Utc::now();

        for task in self.store.list_due_tasks(now).await? {
            if task.is_timeout {
                continue;
            }
            let Some(process) = self.store.get_process(task.process_id).await? else {
                continue;
            };
            if process.is_suspended || process.status.is_terminal() {
                continue;
            }
            if let Err(err) = self.handle_overdue_task(&ctx, task).await {
                warn!(%err, "overdue task handling failed");
            }
        }
        Ok(())
    }

    async fn handle_overdue_task(&self, ctx: &ExecutionContext, task: Task) -> Result<()> {
        let node = self
            .store
            .get_node(task.process_id, &task.node_key)
            .await?
            .ok_or_else(|| EngineError::Fatal(format!("node {} missing", task.node_key)))?;

        self.lock_process(ctx, task.process_id).await?;
        let result = async {
            let mut task = self.task(task.id).await?;
            if task.status.is_terminal() || task.is_timeout {
                return Ok(());
            }
            task.is_timeout = true;
            self.store.save_task(&task).await?;
            self.store
                .append_history(
                    &History::new(HistoryKind::Task, task.process_id, "task_overdue")
                        .with_task(task.id)
                        .with_node(&task.node_key)
                        .with_details(format!("strategy={:?}", node.timeout_strategy)),
                )
                .await?;
            self.bus
                .publish(EngineEvent::for_task(topics::TASK_OVERDUE, &task))
                .await?;

            match node.timeout_strategy {
                TimeoutStrategy::None | TimeoutStrategy::Alert => Ok(()),
                TimeoutStrategy::AutoPass => {
                    self.auto_resolve(ctx, task, TaskAction::AutoPass).await
                }
                TimeoutStrategy::AutoFail => {
                    self.auto_resolve(ctx, task, TaskAction::AutoFail).await
                }
            }
        }
        .await;
        self.unlock_process(task.process_id).await;
        result
    }

    /// System-side completion used by timeout strategies; bypasses the
    /// assignee check (the actor is the engine itself).
    async fn auto_resolve(
        &self,
        ctx: &ExecutionContext,
        mut task: Task,
        action: TaskAction,
    ) -> Result<()> {
        let mut process = self.process(task.process_id).await?;

        task.status = match action {
            TaskAction::AutoFail => TaskStatus::Rejected,
            _ => TaskStatus::Completed,
        };
        task.action = Some(action);
        task.end_time = Some(Utc::now());
        self.store.save_task(&task).await?;
        self.store
            .append_history(
                &History::new(HistoryKind::Task, task.process_id, "task_completed")
                    .with_task(task.id)
                    .with_node(&task.node_key)
                    .with_operator("system")
                    .with_details(format!("action={}", action.as_str())),
            )
            .await?;
        let topic = match task.status {
            TaskStatus::Rejected => topics::TASK_REJECTED,
            _ => topics::TASK_COMPLETED,
        };
        self.bus
            .publish(EngineEvent::for_task(topic, &task).with_operator("system"))
            .await?;

        self.resolve_task_against_node(ctx, &mut process, &task).await
    }

    /// One reminder sweep pass: tasks inside their template's reminder
    /// window get at most one reminder per configured interval.
    pub async fn sweep_reminders_once(&self) -> Result<()> {
        if !self.coordinator.is_leader() {
            return Ok(());
        }
        let now = Utc::now();

        for mut task in self.store.list_tasks_with_due_time().await? {
            let Some(due) = task.due_time else { continue };
            if due <= now {
                continue; // overdue is the timeout sweep's business
            }
            let Some(process) = self.store.get_process(task.process_id).await? else {
                continue;
            };
            if process.is_suspended || process.status.is_terminal() {
                continue;
            }
            let Some(template) = self.store.get_template(process.template_id).await? else {
                continue;
            };
            let cfg = &template.reminder_config;
            if !cfg.enabled {
                continue;
            }
            let window_start = due - chrono::Duration::milliseconds(cfg.lead_ms as i64);
            if now < window_start {
                continue;
            }
            if let Some(last) = task.reminded_at {
                if now - last < chrono::Duration::milliseconds(cfg.interval_ms as i64) {
                    continue;
                }
            }
            task.reminded_at = Some(now);
            self.store.save_task(&task).await?;
            self.bus
                .publish(EngineEvent::for_task(topics::TASK_REMINDER, &task))
                .await?;
        }
        Ok(())
    }

    async fn template_of(&self, process: &ProcessInstance) -> Result<Template> {
        self.store
            .get_template(process.template_id)
            .await?
            .ok_or_else(|| EngineError::not_found("template", process.template_id))
    }
}
