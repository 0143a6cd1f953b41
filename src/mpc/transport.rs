//! Delivery of `Step` requests to other MPC nodes
//!
//! `LocalTransport` routes between nodes living in the same process.
//! `PeerPool` keeps one TCP connection per peer address, reconnects lazily
//! under a per-peer lock, retries transient failures with a fixed back-off
//! and drains in-flight calls on shutdown. A step that timed out after
//! being written may reach the peer twice; learners and predictors drop
//! repeated peer steps.

use super::wire::{StepAck, StepRequest};
use crate::error::{DcpError, Result};
use crate::network::{Connection, Handler};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one step to the node listening at `to`
    async fn step(&self, to: &str, request: StepRequest) -> Result<StepAck>;
}

/// Receiving side of a transport, implemented by the MPC node
pub type StepHandler = dyn Handler<Request = StepRequest, Response = StepAck>;

/// In-process routing table
#[derive(Default)]
pub struct LocalTransport {
    from: String,
    routes: Arc<RwLock<HashMap<String, Weak<StepHandler>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that reports `from` as the sender, sharing this routing table
    pub fn endpoint(&self, from: &str) -> Self {
        Self {
            from: from.to_string(),
            routes: self.routes.clone(),
        }
    }

    pub fn register(&self, addr: &str, handler: Weak<StepHandler>) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(addr.to_string(), handler);
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn step(&self, to: &str, request: StepRequest) -> Result<StepAck> {
        let target = self
            .routes
            .read()
            .map_err(|_| DcpError::Internal("route table poisoned".into()))?
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| DcpError::RpcFindNoPeer(to.to_string()))?;
        target.handle(&self.from, request).await
    }
}

/// Connection pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub timeout: Duration,
    /// Attempts per step before giving up
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            retries: 3,
            backoff: Duration::from_secs(3),
        }
    }
}

type Entry = Arc<AsyncMutex<Option<Connection>>>;

/// Process-wide TCP connections to peers
pub struct PeerPool {
    local: String,
    known: HashSet<String>,
    config: PoolConfig,
    entries: Mutex<HashMap<String, Entry>>,
    inflight: AtomicUsize,
    drained: Notify,
    closed: AtomicBool,
}

struct InflightGuard<'a>(&'a PeerPool);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.0.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl PeerPool {
    /// `peers` restricts the reachable addresses; empty allows any
    pub fn new(local: &str, peers: &[String], config: PoolConfig) -> Self {
        Self {
            local: local.to_string(),
            known: peers.iter().cloned().collect(),
            config,
            entries: Mutex::new(HashMap::new()),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn entry(&self, addr: &str) -> Result<Entry> {
        if addr.is_empty() || (!self.known.is_empty() && !self.known.contains(addr)) {
            return Err(DcpError::RpcFindNoPeer(addr.to_string()));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| DcpError::Internal("peer pool poisoned".into()))?;
        Ok(entries.entry(addr.to_string()).or_default().clone())
    }

    async fn attempt(&self, entry: &Entry, addr: &str, request: &StepRequest) -> Result<StepAck> {
        let mut slot = entry.lock().await;
        if slot.is_none() {
            debug!("[{}] connecting to {}", self.local, addr);
            *slot = Some(Connection::connect(addr, self.config.timeout).await?);
        }
        let conn = slot
            .as_mut()
            .ok_or_else(|| DcpError::Internal("connection slot empty".into()))?;
        let result = conn
            .call(&self.local, request.clone(), self.config.timeout)
            .await;
        if matches!(&result, Err(e) if e.is_transient()) {
            *slot = None;
        }
        result
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Refuse new calls and wait until in-flight ones have finished
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let notified = self.drained.notified();
            if self.inflight() == 0 {
                break;
            }
            notified.await;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

#[async_trait]
impl Transport for PeerPool {
    async fn step(&self, to: &str, request: StepRequest) -> Result<StepAck> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DcpError::RpcConnect(format!("{}: pool shut down", self.local)));
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let _guard = InflightGuard(self);
        let entry = self.entry(to)?;
        let attempts = self.config.retries.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.attempt(&entry, to, &request).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() => {
                    warn!(
                        "[{}] step {} to {} failed (attempt {}/{}): {}",
                        self.local,
                        request.task_id(),
                        to,
                        attempt,
                        attempts,
                        e
                    );
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(DcpError::RpcConnect(format!(
            "{} unreachable after {} attempts: {}",
            to,
            attempts,
            last.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::wire::TrainRequest;
    use crate::network::Server;
    use crate::vfl::Algorithm;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Handler for Counter {
        type Request = StepRequest;
        type Response = StepAck;

        async fn handle(&self, _from: &str, request: StepRequest) -> Result<StepAck> {
            if request.task_id() == "unknown" {
                return Err(DcpError::NotFound("unknown".into()));
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StepAck { delivered: true })
        }
    }

    fn step(task_id: &str) -> StepRequest {
        StepRequest::Train(TrainRequest {
            task_id: task_id.into(),
            algorithm: Algorithm::LinRegVL,
            payload: Vec::new(),
        })
    }

    fn quick() -> PoolConfig {
        PoolConfig {
            timeout: Duration::from_secs(2),
            retries: 3,
            backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_local_transport_routes_by_address() {
        let counter: Arc<StepHandler> = Arc::new(Counter(AtomicUsize::new(0)));
        let net = LocalTransport::new();
        net.register("b", Arc::downgrade(&counter));
        let a = net.endpoint("a");
        assert!(a.step("b", step("t")).await.unwrap().delivered);
        assert_eq!(a.step("c", step("t")).await.unwrap_err().code(), 10005);
    }

    #[tokio::test]
    async fn test_pool_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handler = Arc::new(Counter(AtomicUsize::new(0)));
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(Server::new("srv", handler.clone()).run(listener, stop_rx));

        let pool = PeerPool::new("cli", &[], quick());
        for _ in 0..3 {
            pool.step(&addr, step("t")).await.unwrap();
        }
        assert_eq!(handler.0.load(Ordering::SeqCst), 3);
        // remote errors are not retried
        assert_eq!(pool.step(&addr, step("unknown")).await.unwrap_err().code(), 10002);
        assert_eq!(handler.0.load(Ordering::SeqCst), 3);
        pool.shutdown().await;
        assert_eq!(pool.inflight(), 0);
        assert!(pool.step(&addr, step("t")).await.is_err());
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn test_unreachable_peer_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let pool = PeerPool::new("cli", &[], quick());
        let err = pool.step(&addr, step("t")).await.unwrap_err();
        assert_eq!(err.code(), 10006);
        assert!(err.to_string().contains("3 attempts"));
    }

    #[tokio::test]
    async fn test_unknown_peer_rejected() {
        let pool = PeerPool::new("cli", &["127.0.0.1:1".to_string()], quick());
        let err = pool.step("127.0.0.1:2", step("t")).await.unwrap_err();
        assert_eq!(err.code(), 10005);
    }
}
