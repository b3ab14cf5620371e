use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::Condition;

// ─── Scalar aliases ───────────────────────────────────────────

/// JSON object used for process/task variables and form data.
pub type Variables = serde_json::Map<String, serde_json::Value>;

// ─── Node typing ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Approval,
    Service,
    Exclusive,
    Parallel,
    Cc,
    End,
}

/// Multi-assignee approval policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountersignMode {
    /// First approve advances, first reject rejects.
    #[default]
    Any,
    /// Every assignee must approve; any reject rejects.
    All,
    /// Decided once every task is terminal; > half approvals advance.
    Majority,
}

/// How approval tasks are fanned out over `assignees`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeStrategy {
    /// One task per assignee.
    #[default]
    PerAssignee,
    /// One unassigned task with the assignee set as candidates; a
    /// candidate must claim it before completing.
    AnyOne,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    #[default]
    None,
    AutoPass,
    AutoFail,
    Alert,
}

// ─── Template ─────────────────────────────────────────────────

/// Design-time node definition, copied into a `NodeInstance` when a
/// process is instantiated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_key: String,
    pub name: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub prev_nodes: Vec<String>,
    #[serde(default)]
    pub next_nodes: Vec<String>,
    /// For parallel forks: sibling branch heads (informational).
    #[serde(default)]
    pub parallel_nodes: Vec<String>,
    /// For parallel forks: the join node(s) — precomputed at template
    /// validation as the nearest common descendant of the branches.
    #[serde(default)]
    pub branch_nodes: Vec<String>,
    /// For exclusive nodes: ordered, index-matched against `next_nodes`.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default)]
    pub countersign: CountersignMode,
    #[serde(default)]
    pub assignee_strategy: AssigneeStrategy,
    /// Node-level override: a rejection continues down `next_nodes`
    /// instead of rejecting the process.
    #[serde(default)]
    pub continue_on_reject: bool,
    #[serde(default)]
    pub properties: serde_json::Value,
    /// Names of registered service handlers invoked by service nodes.
    #[serde(default)]
    pub handlers: Vec<String>,
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub retry_interval_ms: u64,
    /// Due dates skip weekends when set.
    #[serde(default)]
    pub is_working_day: bool,
    #[serde(default)]
    pub timeout_duration_ms: Option<u64>,
    #[serde(default)]
    pub timeout_strategy: TimeoutStrategy,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Maximum number of urges per task; 0 = unlimited.
    #[serde(default)]
    pub urge_quota: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReminderConfig {
    #[serde(default)]
    pub enabled: bool,
    /// How long before `due_time` reminders begin.
    #[serde(default)]
    pub lead_ms: u64,
    /// Minimum spacing between reminders for one task.
    #[serde(default)]
    pub interval_ms: u64,
}

/// Immutable versioned workflow definition. Owned by design-time
/// services; read-only to the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub template_key: String,
    /// Unique business code; exactly one version per code is latest.
    pub code: String,
    pub version: u32,
    pub module_code: String,
    pub form_code: String,
    pub node_config: Vec<NodeConfig>,
    #[serde(default)]
    pub process_rules: Vec<Uuid>,
    #[serde(default)]
    pub form_config: serde_json::Value,
    #[serde(default)]
    pub timeout_config: TimeoutConfig,
    #[serde(default)]
    pub reminder_config: ReminderConfig,
    pub is_latest: bool,
    pub disabled: bool,
    #[serde(default)]
    pub effective_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub allow_cancel: bool,
    #[serde(default = "default_true")]
    pub allow_urge: bool,
    #[serde(default = "default_true")]
    pub allow_delegate: bool,
    #[serde(default = "default_true")]
    pub allow_transfer: bool,
}

fn default_true() -> bool {
    true
}

impl Template {
    /// A template accepts new process starts only while latest, enabled,
    /// and inside its effective window.
    pub fn is_startable(&self, now: DateTime<Utc>) -> bool {
        self.is_latest
            && !self.disabled
            && self.effective_time.map_or(true, |t| t <= now)
            && self.expire_time.map_or(true, |t| now < t)
    }

    pub fn node(&self, node_key: &str) -> Option<&NodeConfig> {
        self.node_config.iter().find(|n| n.node_key == node_key)
    }
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    Active,
    Suspended,
    Completed,
    Rejected,
    Cancelled,
    Terminated,
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed
                | ProcessStatus::Rejected
                | ProcessStatus::Cancelled
                | ProcessStatus::Terminated
                | ProcessStatus::Error
        )
    }
}

/// Coarse business-facing progress indicator, distinct from the
/// state-machine `status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Cancelled,
    Terminated,
    Error,
}

/// A running activation of a template against a business key. Mutated
/// only by the engine while holding the per-process lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub process_key: String,
    pub template_id: Uuid,
    pub business_key: String,
    pub initiator: String,
    #[serde(default)]
    pub variables: Variables,
    pub current_node: Option<String>,
    /// Non-terminal ⇒ non-empty; terminal ⇒ empty.
    #[serde(default)]
    pub active_nodes: Vec<String>,
    pub status: ProcessStatus,
    pub flow_status: FlowStatus,
    pub priority: i32,
    pub is_suspended: bool,
    /// When the current suspension began; resume shifts open tasks'
    /// due times by the elapsed window so suspension never consumes
    /// timeout budget.
    #[serde(default)]
    pub suspended_at: Option<DateTime<Utc>>,
    pub urge_count: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
}

// ─── Node instance ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Active,
    Completed,
    Rejected,
    Cancelled,
    Error,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Rejected | NodeStatus::Cancelled | NodeStatus::Error
        )
    }
}

/// Runtime copy of a `NodeConfig`, scoped to one process. All node
/// references (`prev_nodes` etc.) point at nodes of the same process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: Uuid,
    pub node_key: String,
    pub process_id: Uuid,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub name: String,
    pub prev_nodes: Vec<String>,
    pub next_nodes: Vec<String>,
    pub parallel_nodes: Vec<String>,
    pub branch_nodes: Vec<String>,
    pub conditions: Vec<Condition>,
    pub default_branch: Option<String>,
    pub assignees: Vec<String>,
    pub candidates: Vec<String>,
    pub countersign: CountersignMode,
    pub assignee_strategy: AssigneeStrategy,
    pub continue_on_reject: bool,
    pub properties: serde_json::Value,
    pub handlers: Vec<String>,
    pub retry_times: u32,
    pub retry_interval_ms: u64,
    pub is_working_day: bool,
    pub timeout_duration_ms: Option<u64>,
    pub timeout_strategy: TimeoutStrategy,
    pub entered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeInstance {
    /// Instantiate from a template node config.
    pub fn from_config(process_id: Uuid, cfg: &NodeConfig) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_key: cfg.node_key.clone(),
            process_id,
            node_type: cfg.node_type,
            status: NodeStatus::Pending,
            name: cfg.name.clone(),
            prev_nodes: cfg.prev_nodes.clone(),
            next_nodes: cfg.next_nodes.clone(),
            parallel_nodes: cfg.parallel_nodes.clone(),
            branch_nodes: cfg.branch_nodes.clone(),
            conditions: cfg.conditions.clone(),
            default_branch: cfg.default_branch.clone(),
            assignees: cfg.assignees.clone(),
            candidates: cfg.candidates.clone(),
            countersign: cfg.countersign,
            assignee_strategy: cfg.assignee_strategy,
            continue_on_reject: cfg.continue_on_reject,
            properties: cfg.properties.clone(),
            handlers: cfg.handlers.clone(),
            retry_times: cfg.retry_times,
            retry_interval_ms: cfg.retry_interval_ms,
            is_working_day: cfg.is_working_day,
            timeout_duration_ms: cfg.timeout_duration_ms,
            timeout_strategy: cfg.timeout_strategy,
            entered_at: None,
            completed_at: None,
        }
    }
}

// ─── Task ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
    Cancelled,
    Withdrawn,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Rejected
                | TaskStatus::Cancelled
                | TaskStatus::Withdrawn
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Approve,
    Reject,
    AutoPass,
    AutoFail,
    Cancel,
    Withdraw,
    Delegate,
    Transfer,
    Claim,
    Urge,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Approve => "approve",
            TaskAction::Reject => "reject",
            TaskAction::AutoPass => "auto_pass",
            TaskAction::AutoFail => "auto_fail",
            TaskAction::Cancel => "cancel",
            TaskAction::Withdraw => "withdraw",
            TaskAction::Delegate => "delegate",
            TaskAction::Transfer => "transfer",
            TaskAction::Claim => "claim",
            TaskAction::Urge => "urge",
        }
    }
}

/// A unit of work assigned to one or more principals. Completable only
/// by a principal in `assignees`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_key: String,
    pub process_id: Uuid,
    pub node_key: String,
    pub node_type: NodeType,
    /// Ordered; first entry is the primary assignee.
    pub assignees: Vec<String>,
    /// Principals who may claim the task when `assignees` is empty.
    #[serde(default)]
    pub candidates: Vec<String>,
    pub status: TaskStatus,
    pub action: Option<TaskAction>,
    pub comment: Option<String>,
    #[serde(default)]
    pub form_data: serde_json::Value,
    #[serde(default)]
    pub variables: Variables,
    pub priority: i32,
    pub is_urged: bool,
    /// Monotonic non-decreasing.
    pub urge_count: u32,
    pub is_timeout: bool,
    pub is_delegated: bool,
    pub is_transferred: bool,
    pub is_resubmit: bool,
    pub delegated_from: Option<String>,
    pub transferred_from: Option<String>,
    pub claim_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub due_time: Option<DateTime<Utc>>,
    /// Last reminder dispatch, set by the leader reminder sweep.
    pub reminded_at: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub child_ids: Vec<Uuid>,
}

impl Task {
    pub fn new(process_id: Uuid, node: &NodeInstance, assignees: Vec<String>) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            task_key: format!("task-{id}"),
            process_id,
            node_key: node.node_key.clone(),
            node_type: node.node_type,
            assignees,
            candidates: Vec::new(),
            status: TaskStatus::Pending,
            action: None,
            comment: None,
            form_data: serde_json::Value::Null,
            variables: Variables::new(),
            priority: 0,
            is_urged: false,
            urge_count: 0,
            is_timeout: false,
            is_delegated: false,
            is_transferred: false,
            is_resubmit: false,
            delegated_from: None,
            transferred_from: None,
            claim_time: None,
            start_time: Utc::now(),
            end_time: None,
            due_time: None,
            reminded_at: None,
            parent_id: None,
            child_ids: Vec::new(),
        }
    }

    pub fn is_assignee(&self, principal: &str) -> bool {
        self.assignees.iter().any(|a| a == principal)
    }
}

// ─── History ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Process,
    Node,
    Task,
}

/// Append-only audit record. Never mutated once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct History {
    pub id: Uuid,
    pub kind: HistoryKind,
    pub process_id: Uuid,
    pub node_key: Option<String>,
    pub task_id: Option<Uuid>,
    pub operator: Option<String>,
    pub action: Option<String>,
    pub comment: Option<String>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub form_data: serde_json::Value,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl History {
    pub fn new(kind: HistoryKind, process_id: Uuid, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            process_id,
            node_key: None,
            task_id: None,
            operator: None,
            action: Some(action.into()),
            comment: None,
            variables: Variables::new(),
            form_data: serde_json::Value::Null,
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_key: &str) -> Self {
        self.node_key = Some(node_key.to_string());
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_operator(mut self, operator: &str) -> Self {
        self.operator = Some(operator.to_string());
        self
    }

    pub fn with_comment(mut self, comment: Option<&str>) -> Self {
        self.comment = comment.map(str::to_string);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ─── Rules & delegations ──────────────────────────────────────

/// One step of a rule's action list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    /// A terminal action stops rule evaluation after its rule matches.
    #[serde(default)]
    pub terminal: bool,
}

/// Condition/action rule evaluated at node boundaries. Owned by
/// design-time services; read-only to the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub rule_key: String,
    pub template_id: Option<Uuid>,
    pub node_key: Option<String>,
    pub conditions: Condition,
    pub actions: Vec<RuleAction>,
    pub priority: i32,
    pub is_enabled: bool,
    #[serde(default)]
    pub effective_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_time: Option<DateTime<Utc>>,
}

impl Rule {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled
            && self.effective_time.map_or(true, |t| t <= now)
            && self.expire_time.map_or(true, |t| now <= t)
    }
}

/// Redirects tasks from `delegator_id` to `delegatee_id` while active.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delegation {
    pub id: Uuid,
    pub delegator_id: String,
    pub delegatee_id: String,
    /// Empty = any template.
    pub template_id: Option<Uuid>,
    /// Empty = any node type.
    pub node_type: Option<NodeType>,
    pub conditions: Option<Condition>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_enabled: bool,
}

impl Delegation {
    /// Active when enabled and `start_time <= now < end_time`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled && self.start_time <= now && now < self.end_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_predicates() {
        assert!(!ProcessStatus::Active.is_terminal());
        assert!(!ProcessStatus::Suspended.is_terminal());
        assert!(ProcessStatus::Rejected.is_terminal());
        assert!(TaskStatus::Withdrawn.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(NodeStatus::Error.is_terminal());
    }

    #[test]
    fn template_startability_window() {
        let now = Utc::now();
        let mut t = Template {
            id: Uuid::now_v7(),
            template_key: "tk".into(),
            code: "leave".into(),
            version: 1,
            module_code: "hr".into(),
            form_code: "leave-form".into(),
            node_config: vec![],
            process_rules: vec![],
            form_config: serde_json::Value::Null,
            timeout_config: TimeoutConfig::default(),
            reminder_config: ReminderConfig::default(),
            is_latest: true,
            disabled: false,
            effective_time: None,
            expire_time: None,
            allow_cancel: true,
            allow_urge: true,
            allow_delegate: true,
            allow_transfer: true,
        };
        assert!(t.is_startable(now));

        t.disabled = true;
        assert!(!t.is_startable(now));

        t.disabled = false;
        t.expire_time = Some(now - chrono::Duration::seconds(1));
        assert!(!t.is_startable(now));
    }

    #[test]
    fn delegation_window_is_half_open() {
        let now = Utc::now();
        let d = Delegation {
            id: Uuid::now_v7(),
            delegator_id: "alice".into(),
            delegatee_id: "carol".into(),
            template_id: None,
            node_type: None,
            conditions: None,
            start_time: now,
            end_time: now + chrono::Duration::hours(1),
            is_enabled: true,
        };
        assert!(d.is_active(now));
        assert!(!d.is_active(now + chrono::Duration::hours(1)));
    }
}
