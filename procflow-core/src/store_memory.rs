//! In-memory implementations of the engine's external surfaces
//! (`WorkflowStore`, `EventBus`, `KvStore`) for tests and POC use.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::coordinator::KvStore;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::store::WorkflowStore;
use crate::types::*;

// ─── Workflow store ───────────────────────────────────────────

#[derive(Default)]
struct Inner {
    templates: HashMap<Uuid, Template>,
    processes: HashMap<Uuid, ProcessInstance>,
    nodes: HashMap<(Uuid, String), NodeInstance>,
    join_counters: HashMap<(Uuid, String), u32>,
    tasks: HashMap<Uuid, Task>,
    history: Vec<History>,
    rules: Vec<Rule>,
    delegations: Vec<Delegation>,
}

/// In-memory `WorkflowStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a rule (rules are owned by design-time services, so this
    /// is not part of the engine-facing trait).
    pub async fn insert_rule(&self, rule: Rule) {
        self.inner.write().await.rules.push(rule);
    }

    /// Seed a delegation.
    pub async fn insert_delegation(&self, delegation: Delegation) {
        self.inner.write().await.delegations.push(delegation);
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    // ── Templates ──

    async fn save_template(&self, template: &Template) -> Result<()> {
        let mut w = self.inner.write().await;
        w.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        let r = self.inner.read().await;
        Ok(r.templates.get(&id).cloned())
    }

    async fn latest_template(&self, code: &str) -> Result<Option<Template>> {
        let r = self.inner.read().await;
        Ok(r.templates
            .values()
            .find(|t| t.code == code && t.is_latest)
            .cloned())
    }

    async fn set_latest_version(&self, code: &str, version: u32) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w
            .templates
            .values()
            .any(|t| t.code == code && t.version == version)
        {
            return Err(EngineError::not_found("template version", format!("{code}/{version}")));
        }
        for t in w.templates.values_mut().filter(|t| t.code == code) {
            t.is_latest = t.version == version;
        }
        Ok(())
    }

    // ── Processes ──

    async fn save_process(&self, process: &ProcessInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        w.processes.insert(process.id, process.clone());
        Ok(())
    }

    async fn get_process(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.processes.get(&id).cloned())
    }

    async fn find_process_by_business_key(
        &self,
        template_id: Uuid,
        business_key: &str,
    ) -> Result<Option<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.processes
            .values()
            .find(|p| p.template_id == template_id && p.business_key == business_key)
            .cloned())
    }

    async fn list_active_processes(&self) -> Result<Vec<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.processes
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect())
    }

    // ── Nodes ──

    async fn save_node(&self, node: &NodeInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        w.nodes
            .insert((node.process_id, node.node_key.clone()), node.clone());
        Ok(())
    }

    async fn get_node(&self, process_id: Uuid, node_key: &str) -> Result<Option<NodeInstance>> {
        let r = self.inner.read().await;
        Ok(r.nodes.get(&(process_id, node_key.to_string())).cloned())
    }

    async fn list_nodes(&self, process_id: Uuid) -> Result<Vec<NodeInstance>> {
        let r = self.inner.read().await;
        Ok(r.nodes
            .iter()
            .filter(|((pid, _), _)| *pid == process_id)
            .map(|(_, n)| n.clone())
            .collect())
    }

    // ── Join barriers ──

    async fn join_arrive(&self, process_id: Uuid, node_key: &str) -> Result<u32> {
        let mut w = self.inner.write().await;
        let count = w
            .join_counters
            .entry((process_id, node_key.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn join_reset(&self, process_id: Uuid, node_key: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.join_counters
            .insert((process_id, node_key.to_string()), 0);
        Ok(())
    }

    // ── Tasks ──

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks.get(&id).cloned())
    }

    async fn list_tasks_for_node(&self, process_id: Uuid, node_key: &str) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        let mut tasks: Vec<Task> = r
            .tasks
            .values()
            .filter(|t| t.process_id == process_id && t.node_key == node_key)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn list_open_tasks(&self, process_id: Uuid) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks
            .values()
            .filter(|t| t.process_id == process_id && !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks
            .values()
            .filter(|t| {
                !t.status.is_terminal() && t.due_time.map_or(false, |due| due <= now)
            })
            .cloned()
            .collect())
    }

    async fn list_tasks_with_due_time(&self) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks
            .values()
            .filter(|t| !t.status.is_terminal() && t.due_time.is_some())
            .cloned()
            .collect())
    }

    // ── History ──

    async fn append_history(&self, entry: &History) -> Result<()> {
        let mut w = self.inner.write().await;
        w.history.push(entry.clone());
        Ok(())
    }

    async fn list_history(&self, process_id: Uuid) -> Result<Vec<History>> {
        let r = self.inner.read().await;
        Ok(r.history
            .iter()
            .filter(|h| h.process_id == process_id)
            .cloned()
            .collect())
    }

    // ── Rules & delegations ──

    async fn list_rules(
        &self,
        template_id: Option<Uuid>,
        node_key: Option<&str>,
    ) -> Result<Vec<Rule>> {
        let r = self.inner.read().await;
        Ok(r.rules
            .iter()
            .filter(|rule| {
                let template_ok = match (rule.template_id, template_id) {
                    (Some(rt), Some(qt)) => rt == qt,
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                let node_ok = match (&rule.node_key, node_key) {
                    (Some(rn), Some(qn)) => rn == qn,
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                template_ok && node_ok
            })
            .cloned()
            .collect())
    }

    async fn list_delegations(&self, delegator_id: &str) -> Result<Vec<Delegation>> {
        let r = self.inner.read().await;
        Ok(r.delegations
            .iter()
            .filter(|d| d.delegator_id == delegator_id)
            .cloned()
            .collect())
    }
}

// ─── Event bus ────────────────────────────────────────────────

/// Records published events for assertion.
#[derive(Default)]
pub struct MemoryBus {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.topic.clone())
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.topic == topic)
            .count()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

// ─── Key-value / lock store ───────────────────────────────────

struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct KvInner {
    locks: HashMap<String, Lease>,
    services: HashMap<String, (Duration, Instant)>,
}

/// In-memory `KvStore` with session-style lease expiry.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<KvInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live services (refreshed within their TTL).
    pub fn live_services(&self) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .services
            .iter()
            .filter(|(_, (_, expires))| *expires > now)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.locks.get(key) {
            Some(lease) if lease.expires_at > now && lease.owner != owner => Ok(false),
            _ => {
                inner.locks.insert(
                    key.to_string(),
                    Lease {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .locks
            .get(key)
            .map_or(false, |lease| lease.owner == owner)
        {
            inner.locks.remove(key);
        }
        Ok(())
    }

    async fn owner(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        Ok(inner
            .locks
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner.clone()))
    }

    async fn register_service(&self, service_id: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .services
            .insert(service_id.to_string(), (ttl, Instant::now() + ttl));
        Ok(())
    }

    async fn refresh_service(&self, service_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.services.get_mut(service_id) {
            Some((ttl, expires)) if *expires > now => {
                *expires = now + *ttl;
                Ok(())
            }
            Some(_) => {
                // TTL lapsed: the store has deregistered the node.
                inner.services.remove(service_id);
                Err(EngineError::not_found("service", service_id))
            }
            None => Err(EngineError::not_found("service", service_id)),
        }
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        self.inner.lock().unwrap().services.remove(service_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_expires_and_can_be_retaken() {
        let kv = MemoryKv::new();
        assert!(kv.acquire("k", "a", Duration::from_millis(20)).await.unwrap());
        assert!(!kv.acquire("k", "b", Duration::from_millis(20)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.acquire("k", "b", Duration::from_millis(20)).await.unwrap());
    }

    #[tokio::test]
    async fn reacquire_by_owner_renews() {
        let kv = MemoryKv::new();
        assert!(kv.acquire("k", "a", Duration::from_millis(50)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.acquire("k", "a", Duration::from_millis(50)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Still held: renewal reset the clock.
        assert!(!kv.acquire("k", "b", Duration::from_millis(50)).await.unwrap());
    }

    #[tokio::test]
    async fn release_by_non_owner_is_a_no_op() {
        let kv = MemoryKv::new();
        assert!(kv.acquire("k", "a", Duration::from_secs(5)).await.unwrap());
        kv.release("k", "b").await.unwrap();
        assert_eq!(kv.owner("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn unrefreshed_service_is_deregistered() {
        let kv = MemoryKv::new();
        kv.register_service("workflow-n1", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(kv.live_services(), vec!["workflow-n1".to_string()]);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.live_services().is_empty());
        assert!(kv.refresh_service("workflow-n1").await.is_err());
    }

    #[tokio::test]
    async fn set_latest_version_swaps_atomically() {
        let store = MemoryStore::new();
        let mk = |version: u32, is_latest: bool| Template {
            id: Uuid::now_v7(),
            template_key: format!("leave-{version}"),
            code: "leave".into(),
            version,
            module_code: "hr".into(),
            form_code: "f".into(),
            node_config: vec![],
            process_rules: vec![],
            form_config: serde_json::Value::Null,
            timeout_config: TimeoutConfig::default(),
            reminder_config: ReminderConfig::default(),
            is_latest,
            disabled: false,
            effective_time: None,
            expire_time: None,
            allow_cancel: true,
            allow_urge: true,
            allow_delegate: true,
            allow_transfer: true,
        };
        store.save_template(&mk(1, true)).await.unwrap();
        store.save_template(&mk(2, false)).await.unwrap();

        store.set_latest_version("leave", 2).await.unwrap();
        let latest = store.latest_template("leave").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);

        // Exactly one latest row per code.
        let r = store.inner.read().await;
        let latest_count = r
            .templates
            .values()
            .filter(|t| t.code == "leave" && t.is_latest)
            .count();
        assert_eq!(latest_count, 1);
    }

    #[tokio::test]
    async fn rule_scope_filtering() {
        let store = MemoryStore::new();
        let tid = Uuid::now_v7();
        let mk = |key: &str, template_id: Option<Uuid>, node_key: Option<&str>| Rule {
            id: Uuid::now_v7(),
            rule_key: key.into(),
            template_id,
            node_key: node_key.map(str::to_string),
            conditions: crate::rules::Condition::cmp("x", crate::rules::CmpOp::Exists, serde_json::Value::Null),
            actions: vec![],
            priority: 0,
            is_enabled: true,
            effective_time: None,
            expire_time: None,
        };
        store.insert_rule(mk("global", None, None)).await;
        store.insert_rule(mk("tpl", Some(tid), None)).await;
        store.insert_rule(mk("node", Some(tid), Some("approve"))).await;
        store.insert_rule(mk("other", Some(Uuid::now_v7()), None)).await;

        let rules = store.list_rules(Some(tid), Some("approve")).await.unwrap();
        let mut keys: Vec<&str> = rules.iter().map(|r| r.rule_key.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["global", "node", "tpl"]);
    }
}
