use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rhizo_types::{Operation, ReplicaId, RhizoError};

/// Best-effort, at-least-once delivery of operations to peers.
///
/// Inbound operations are not pulled through this trait; the transport
/// hands them to the node on an `mpsc` receiver at init.
pub trait GossipTransport: Send + Sync + 'static {
    fn send(
        &self,
        peer: ReplicaId,
        op: Operation,
    ) -> impl std::future::Future<Output = Result<(), RhizoError>> + Send;
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Time allowed at shutdown for queued operations to reach peers.
    pub drain_timeout_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig { initial_backoff_ms: 20, max_backoff_ms: 2_000, drain_timeout_ms: 1_000 }
    }
}

// ---------------------------------------------------------------------------
// Gossip: one sender task per peer
// ---------------------------------------------------------------------------

/// Fire-and-forget fan-out of locally committed operations.
///
/// Each peer has its own unbounded queue and sender task, so a slow or
/// partitioned peer never delays delivery to the others, and callers never
/// wait on the network.
pub struct Gossip {
    queues: Mutex<Vec<(ReplicaId, mpsc::UnboundedSender<Operation>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl Gossip {
    /// Spawn one sender per peer. Must be called inside a Tokio runtime.
    pub fn start<T: GossipTransport>(transport: Arc<T>, peers: &[ReplicaId], config: &GossipConfig) -> Self {
        let mut queues = Vec::with_capacity(peers.len());
        let mut tasks = Vec::with_capacity(peers.len());
        for &peer in peers {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push((peer, tx));
            tasks.push(tokio::spawn(run_sender(transport.clone(), peer, rx, config.clone())));
        }
        Gossip {
            queues: Mutex::new(queues),
            tasks: Mutex::new(tasks),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
        }
    }

    pub fn peers(&self) -> Vec<ReplicaId> {
        self.queues.lock().iter().map(|(peer, _)| *peer).collect()
    }

    /// Queue `op` for every peer.
    pub fn disseminate(&self, op: &Operation) {
        for (peer, queue) in self.queues.lock().iter() {
            if queue.send(op.clone()).is_err() {
                tracing::debug!(peer, op_id = %op.id(), "gossip queue closed, dropping");
            }
        }
    }

    /// Close the queues, give senders `drain_timeout` to flush, then cancel
    /// whatever is still retrying. Returns the number of senders cancelled.
    pub async fn shutdown(&self) -> usize {
        self.queues.lock().clear();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());

        let deadline = Instant::now() + self.drain_timeout;
        for task in tasks.iter_mut() {
            let _ = tokio::time::timeout_at(deadline, task).await;
        }

        let mut cancelled = 0;
        for task in tasks {
            if !task.is_finished() {
                task.abort();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::warn!(cancelled, "gossip drain timed out, cancelled undelivered sends");
        }
        cancelled
    }
}

async fn run_sender<T: GossipTransport>(
    transport: Arc<T>,
    peer: ReplicaId,
    mut queue: mpsc::UnboundedReceiver<Operation>,
    config: GossipConfig,
) {
    let initial = Duration::from_millis(config.initial_backoff_ms);
    let max = Duration::from_millis(config.max_backoff_ms);

    while let Some(op) = queue.recv().await {
        let mut backoff = initial;
        while let Err(e) = transport.send(peer, op.clone()).await {
            tracing::debug!(peer, op_id = %op.id(), error = %e, "gossip send failed, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max);
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryNetwork: loopback transport with partition control
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetInner {
    inboxes: HashMap<ReplicaId, mpsc::UnboundedSender<Operation>>,
    /// Directed links that currently drop every send.
    cut: HashSet<(ReplicaId, ReplicaId)>,
    duplicate: bool,
}

/// In-process network connecting replicas of one process.
#[derive(Default)]
pub struct InMemoryNetwork {
    inner: RwLock<NetInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `replica` and return its transport and inbound stream.
    pub fn join(self: &Arc<Self>, replica: ReplicaId) -> (MemTransport, mpsc::UnboundedReceiver<Operation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().inboxes.insert(replica, tx);
        (MemTransport { network: self.clone(), local: replica }, rx)
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: ReplicaId, b: ReplicaId) {
        let mut g = self.inner.write();
        g.cut.insert((a, b));
        g.cut.insert((b, a));
    }

    pub fn heal(&self, a: ReplicaId, b: ReplicaId) {
        let mut g = self.inner.write();
        g.cut.remove(&(a, b));
        g.cut.remove(&(b, a));
    }

    pub fn heal_all(&self) {
        self.inner.write().cut.clear();
    }

    /// Deliver every message twice.
    pub fn set_duplicate_delivery(&self, on: bool) {
        self.inner.write().duplicate = on;
    }

    fn deliver(&self, from: ReplicaId, to: ReplicaId, op: Operation) -> Result<(), RhizoError> {
        let g = self.inner.read();
        if g.cut.contains(&(from, to)) {
            return Err(RhizoError::Transport(format!("link {from} -> {to} is down")));
        }
        let inbox = g
            .inboxes
            .get(&to)
            .ok_or_else(|| RhizoError::Transport(format!("unknown peer {to}")))?;
        if g.duplicate {
            inbox
                .send(op.clone())
                .map_err(|_| RhizoError::Transport(format!("peer {to} stopped receiving")))?;
        }
        inbox
            .send(op)
            .map_err(|_| RhizoError::Transport(format!("peer {to} stopped receiving")))
    }
}

pub struct MemTransport {
    network: Arc<InMemoryNetwork>,
    local: ReplicaId,
}

impl GossipTransport for MemTransport {
    async fn send(&self, peer: ReplicaId, op: Operation) -> Result<(), RhizoError> {
        self.network.deliver(self.local, peer, op)
    }
}
