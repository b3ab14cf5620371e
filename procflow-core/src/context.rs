//! Per-invocation execution context threaded through a process step.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::Variables;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Initializing,
    Executing,
    Completing,
    Rollback,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct ContextState {
    pub phase: Phase,
    pub is_retry: bool,
    pub retry_count: u32,
    pub is_timeout: bool,
    pub is_canceled: bool,
}

#[derive(Debug, Default)]
struct Inner {
    variables: Variables,
    metadata: HashMap<String, Value>,
    state: ContextState,
    errors: Vec<String>,
}

/// Carries cancellation scope, timing, identifiers, a variable store,
/// metadata, and mutable step state through a single process step.
///
/// Mutation is guarded by an internal lock; the context is safe to
/// share within one step. Passing it across parallel branches requires
/// [`ExecutionContext::clone_branch`].
#[derive(Debug)]
pub struct ExecutionContext {
    token: CancellationToken,
    pub started_at: DateTime<Utc>,
    pub process_id: Option<Uuid>,
    pub node_key: Option<String>,
    pub task_id: Option<Uuid>,
    pub operator: Option<String>,
    inner: Mutex<Inner>,
}

impl ExecutionContext {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            started_at: Utc::now(),
            process_id: None,
            node_key: None,
            task_id: None,
            operator: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn for_operator(token: CancellationToken, operator: &str) -> Self {
        let mut ctx = Self::new(token);
        ctx.operator = Some(operator.to_string());
        ctx
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    // ── Variables ──

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.variables.insert(key.into(), value);
    }

    pub fn get_variable(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        inner.variables.get(key).cloned()
    }

    /// Snapshot of the variable store.
    pub fn variables(&self) -> Variables {
        self.inner.lock().unwrap().variables.clone()
    }

    /// Shallow merge, overwriting existing keys.
    pub fn merge_variables(&self, other: &Variables) {
        let mut inner = self.inner.lock().unwrap();
        for (k, v) in other {
            inner.variables.insert(k.clone(), v.clone());
        }
    }

    // ── Metadata ──

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().unwrap().metadata.insert(key.into(), value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().metadata.get(key).cloned()
    }

    // ── State ──

    pub fn state(&self) -> ContextState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn set_phase(&self, phase: Phase) {
        self.inner.lock().unwrap().state.phase = phase;
    }

    pub fn mark_retry(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.is_retry = true;
        inner.state.retry_count += 1;
    }

    pub fn mark_timeout(&self) {
        self.inner.lock().unwrap().state.is_timeout = true;
    }

    /// Flip `is_canceled` and close the scope; downstream operations
    /// observing the token must abort promptly.
    pub fn cancel(&self) {
        self.inner.lock().unwrap().state.is_canceled = true;
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.lock().unwrap().state.is_canceled || self.token.is_cancelled()
    }

    // ── Errors ──

    pub fn record_error(&self, err: impl Into<String>) {
        self.inner.lock().unwrap().errors.push(err.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.lock().unwrap().errors.clone()
    }

    /// Independent copy for a parallel branch: variables are
    /// deep-copied, metadata and errors snapshot-copied, and only the
    /// parent cancellation scope is shared (as a child token), so
    /// branch executions cannot see each other's writes.
    pub fn clone_branch(&self) -> Self {
        let inner = self.inner.lock().unwrap();
        Self {
            token: self.token.child_token(),
            started_at: self.started_at,
            process_id: self.process_id,
            node_key: self.node_key.clone(),
            task_id: self.task_id,
            operator: self.operator.clone(),
            inner: Mutex::new(Inner {
                variables: inner.variables.clone(),
                metadata: inner.metadata.clone(),
                state: inner.state.clone(),
                errors: inner.errors.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn branch_clones_do_not_share_variables() {
        let ctx = ExecutionContext::new(CancellationToken::new());
        ctx.set_variable("a", json!(1));

        let branch = ctx.clone_branch();
        branch.set_variable("a", json!(2));
        branch.set_variable("b", json!(true));

        assert_eq!(ctx.get_variable("a"), Some(json!(1)));
        assert_eq!(ctx.get_variable("b"), None);
        assert_eq!(branch.get_variable("a"), Some(json!(2)));
    }

    #[test]
    fn parent_cancel_reaches_branches() {
        let ctx = ExecutionContext::new(CancellationToken::new());
        let branch = ctx.clone_branch();
        ctx.cancel();
        assert!(ctx.is_canceled());
        assert!(branch.token().is_cancelled());
    }

    #[test]
    fn branch_cancel_does_not_reach_parent() {
        let ctx = ExecutionContext::new(CancellationToken::new());
        let branch = ctx.clone_branch();
        branch.cancel();
        assert!(!ctx.is_canceled());
    }

    #[test]
    fn merge_overwrites_existing_keys() {
        let ctx = ExecutionContext::new(CancellationToken::new());
        ctx.set_variable("x", json!("old"));

        let mut incoming = Variables::new();
        incoming.insert("x".into(), json!("new"));
        incoming.insert("y".into(), json!(7));
        ctx.merge_variables(&incoming);

        assert_eq!(ctx.get_variable("x"), Some(json!("new")));
        assert_eq!(ctx.get_variable("y"), Some(json!(7)));
    }

    #[test]
    fn retry_marks_accumulate() {
        let ctx = ExecutionContext::new(CancellationToken::new());
        ctx.mark_retry();
        ctx.mark_retry();
        let state = ctx.state();
        assert!(state.is_retry);
        assert_eq!(state.retry_count, 2);
    }
}
