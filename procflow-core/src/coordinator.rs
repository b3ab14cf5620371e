//! Distributed coordination: leader election, named locks, and service
//! health, backed by an external consistent key-value store with
//! session-bound locks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::events::{topics, EngineEvent, EventBus};
use crate::retry::{retry, RetryCallbacks, RetryConfig};

/// The external store's session-lock surface. `acquire` is try-once:
/// one attempt, no internal queueing, so callers can implement their
/// own policy. Leases expire server-side after `ttl` unless renewed by
/// re-acquiring with the same owner.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns true when the lock was taken (or already held by `owner`,
    /// renewing the lease).
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Idempotent; releasing a lock held by someone else is a no-op.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
    /// Current owner, if the lease is live.
    async fn owner(&self, key: &str) -> Result<Option<String>>;

    /// Register a TTL health entry; unrefreshed entries are
    /// deregistered by the store after the TTL lapses.
    async fn register_service(&self, service_id: &str, ttl: Duration) -> Result<()>;
    async fn refresh_service(&self, service_id: &str) -> Result<()>;
    async fn deregister_service(&self, service_id: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Key prefix in the external store.
    pub namespace: String,
    /// Stable identity of this engine node.
    pub node_id: String,
    pub lock_ttl: Duration,
    /// Election attempts per campaign round.
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub health_check_interval: Duration,
    /// TTL of the service health entry.
    pub deregister_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: "procflow".into(),
            node_id: format!("node-{}", uuid::Uuid::now_v7()),
            lock_ttl: Duration::from_secs(15),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(5),
            deregister_timeout: Duration::from_secs(30),
        }
    }
}

struct Shared {
    kv: Arc<dyn KvStore>,
    bus: Arc<dyn EventBus>,
    cfg: CoordinatorConfig,
    is_leader: AtomicBool,
    held_locks: tokio::sync::Mutex<HashSet<String>>,
    token: CancellationToken,
}

impl Shared {
    fn leader_key(&self) -> String {
        format!("{}/workflow/leader", self.cfg.namespace)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}/workflow/locks/{name}", self.cfg.namespace)
    }

    fn service_id(&self) -> String {
        format!("workflow-{}", self.cfg.node_id)
    }

    async fn publish(&self, topic: &str) {
        let ev = EngineEvent::new(topic).with_operator(&self.cfg.node_id);
        if let Err(err) = self.bus.publish(ev).await {
            warn!(topic, %err, "failed to publish coordination event");
        }
    }

    /// One campaign round: up to `max_retries` acquisition attempts at
    /// `retry_interval`. Returns true when leadership was won.
    async fn campaign(&self) -> bool {
        let cfg = RetryConfig {
            jitter: false,
            ..RetryConfig::fixed(self.cfg.max_retries, self.cfg.retry_interval)
        };
        let key = self.leader_key();
        let result = retry(&self.token, &cfg, &RetryCallbacks::default(), |_| {
            let key = key.clone();
            async move {
                if self
                    .kv
                    .acquire(&key, &self.cfg.node_id, self.cfg.lock_ttl)
                    .await?
                {
                    Ok(())
                } else {
                    Err(EngineError::lock_contention(&key))
                }
            }
        })
        .await;
        result.is_ok()
    }

    async fn election_tick(&self) {
        if self.is_leader.load(Ordering::SeqCst) {
            // Renew the lease; losing it means a peer may take over.
            let renewed = self
                .kv
                .acquire(&self.leader_key(), &self.cfg.node_id, self.cfg.lock_ttl)
                .await
                .unwrap_or(false);
            if !renewed {
                self.is_leader.store(false, Ordering::SeqCst);
                warn!(node_id = %self.cfg.node_id, "leadership lost");
                self.publish(topics::LEADER_LOST).await;
            }
        } else if self.campaign().await {
            self.is_leader.store(true, Ordering::SeqCst);
            info!(node_id = %self.cfg.node_id, "leadership acquired");
            self.publish(topics::LEADER_ELECTED).await;
        }
    }
}

/// Coordinates one engine node against the cluster: a single
/// process-wide leader, named distributed locks, and a TTL health
/// entry that triggers peer failover when this node goes silent.
pub struct Coordinator {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(kv: Arc<dyn KvStore>, bus: Arc<dyn EventBus>, cfg: CoordinatorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                kv,
                bus,
                cfg,
                is_leader: AtomicBool::new(false),
                held_locks: tokio::sync::Mutex::new(HashSet::new()),
                token: CancellationToken::new(),
            }),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register the service health entry and spawn the election and
    /// health-refresh loops.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        shared
            .kv
            .register_service(&shared.service_id(), shared.cfg.deregister_timeout)
            .await?;

        let mut tasks = self.tasks.lock().await;

        let s = shared.clone();
        tasks.push(tokio::spawn(async move {
            // Renew well inside the TTL so a slow tick does not drop the lease.
            let renew_every = s.cfg.lock_ttl / 2;
            loop {
                s.election_tick().await;
                tokio::select! {
                    _ = s.token.cancelled() => break,
                    _ = tokio::time::sleep(renew_every) => {}
                }
            }
        }));

        let s = shared.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = s.token.cancelled() => break,
                    _ = tokio::time::sleep(s.cfg.health_check_interval) => {}
                }
                if let Err(err) = s.kv.refresh_service(&s.service_id()).await {
                    warn!(%err, "health refresh failed");
                }
            }
        }));

        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader.load(Ordering::SeqCst)
    }

    /// Take the named lock with try-once semantics. Failure returns
    /// immediately as `Transient` lock contention so callers can wrap
    /// acquisition in their own retry policy.
    pub async fn acquire_lock(&self, token: &CancellationToken, name: &str) -> Result<()> {
        if token.is_cancelled() {
            return Err(EngineError::Cancelled(format!("acquiring lock {name}")));
        }
        let s = &self.shared;
        let key = s.lock_key(name);
        if s.kv.acquire(&key, &s.cfg.node_id, s.cfg.lock_ttl).await? {
            s.held_locks.lock().await.insert(name.to_string());
            debug!(lock = name, "lock acquired");
            Ok(())
        } else {
            Err(EngineError::lock_contention(name))
        }
    }

    /// Idempotent.
    pub async fn release_lock(&self, name: &str) -> Result<()> {
        let s = &self.shared;
        if s.held_locks.lock().await.remove(name) {
            s.kv.release(&s.lock_key(name), &s.cfg.node_id).await?;
            debug!(lock = name, "lock released");
        }
        Ok(())
    }

    /// Stop loops, release every held lock (leadership included), and
    /// deregister the health entry.
    pub async fn stop(&self) {
        let s = &self.shared;
        s.token.cancel();
        for handle in self.tasks.lock().await.drain(..) {
            let _ = handle.await;
        }

        let held: Vec<String> = s.held_locks.lock().await.drain().collect();
        for name in held {
            if let Err(err) = s.kv.release(&s.lock_key(&name), &s.cfg.node_id).await {
                warn!(lock = %name, %err, "failed to release lock on stop");
            }
        }

        if s.is_leader.swap(false, Ordering::SeqCst) {
            let _ = s.kv.release(&s.leader_key(), &s.cfg.node_id).await;
            s.publish(topics::LEADER_LOST).await;
        }

        if let Err(err) = s.kv.deregister_service(&s.service_id()).await {
            warn!(%err, "failed to deregister service");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::{MemoryBus, MemoryKv};

    fn quick_cfg(node_id: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            namespace: "test".into(),
            node_id: node_id.into(),
            lock_ttl: Duration::from_millis(200),
            max_retries: 2,
            retry_interval: Duration::from_millis(10),
            health_check_interval: Duration::from_millis(50),
            deregister_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn single_node_becomes_leader_and_publishes() {
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let coord = Coordinator::new(kv, bus.clone(), quick_cfg("n1"));
        coord.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coord.is_leader());
        assert!(bus.topics().contains(&topics::LEADER_ELECTED.to_string()));

        coord.stop().await;
        assert!(!coord.is_leader());
        assert!(bus.topics().contains(&topics::LEADER_LOST.to_string()));
    }

    #[tokio::test]
    async fn at_most_one_leader_among_peers() {
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let a = Coordinator::new(kv.clone(), bus.clone(), quick_cfg("a"));
        let b = Coordinator::new(kv.clone(), bus.clone(), quick_cfg("b"));
        a.start().await.unwrap();
        b.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(a.is_leader() ^ b.is_leader(), "exactly one leader expected");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn leader_failure_triggers_failover_within_ttl() {
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let a = Coordinator::new(kv.clone(), bus.clone(), quick_cfg("a"));
        a.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.is_leader());

        // Hard-kill a: loops stop without releasing the lease.
        a.shared.token.cancel();

        let b = Coordinator::new(kv.clone(), bus.clone(), quick_cfg("b"));
        b.start().await.unwrap();

        // b must win once a's lease (200ms) expires.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(b.is_leader());
        b.stop().await;
    }

    #[tokio::test]
    async fn lock_is_try_once_and_release_is_idempotent() {
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let a = Coordinator::new(kv.clone(), bus.clone(), quick_cfg("a"));
        let b = Coordinator::new(kv.clone(), bus.clone(), quick_cfg("b"));
        let token = CancellationToken::new();

        a.acquire_lock(&token, "proc/1").await.unwrap();
        let err = b.acquire_lock(&token, "proc/1").await.unwrap_err();
        assert!(err.is_retryable());

        a.release_lock("proc/1").await.unwrap();
        a.release_lock("proc/1").await.unwrap();
        b.acquire_lock(&token, "proc/1").await.unwrap();
        b.release_lock("proc/1").await.unwrap();
    }

    #[tokio::test]
    async fn stop_releases_held_locks() {
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let a = Coordinator::new(kv.clone(), bus.clone(), quick_cfg("a"));
        let b = Coordinator::new(kv.clone(), bus.clone(), quick_cfg("b"));
        let token = CancellationToken::new();

        a.acquire_lock(&token, "proc/9").await.unwrap();
        a.stop().await;
        b.acquire_lock(&token, "proc/9").await.unwrap();
        b.stop().await;
    }
}
