use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use rhizo_classifier::Classifier;
use rhizo_consensus::{CommittedLogApplier, ConsensusGateway, ConsensusService};
use rhizo_storage::{KeyState, MemReplicaStore, ReplicaStore, Snapshot};
use rhizo_types::{Batch, CommitRecord, Operation, ReplicaId, RhizoError};

use crate::config::NodeConfig;
use crate::fast_path::CoordinationFreeEngine;
use crate::gossip::{Gossip, GossipTransport};
use crate::metrics::{NoopMetrics, RouterMetrics};
use crate::router::TransactionRouter;

/// One replica: its state, both commit paths, and the background tasks
/// that feed them.
///
/// Owns everything it starts. Nothing is global, so several nodes can run
/// side by side in one process.
pub struct Node<C: ConsensusService> {
    replica: ReplicaId,
    store: Arc<MemReplicaStore>,
    applier: Arc<CommittedLogApplier<C, MemReplicaStore>>,
    router: TransactionRouter<MemReplicaStore, C>,
    gossip: Arc<Gossip>,
    shutdown: watch::Sender<bool>,
    applier_task: JoinHandle<()>,
    receiver_task: JoinHandle<()>,
}

impl<C: ConsensusService> Node<C> {
    /// Start a replica. Must be called inside a Tokio runtime.
    ///
    /// `peers` may include `replica` itself; it is skipped. `inbound` is the
    /// stream of operations gossiped to this replica by `transport`'s network.
    pub fn init<T: GossipTransport>(
        replica: ReplicaId,
        peers: &[ReplicaId],
        config: &NodeConfig,
        consensus: Arc<C>,
        transport: Arc<T>,
        inbound: mpsc::UnboundedReceiver<Operation>,
    ) -> Result<Self, RhizoError> {
        Self::init_with_metrics(replica, peers, config, consensus, transport, inbound, Arc::new(NoopMetrics))
    }

    pub fn init_with_metrics<T: GossipTransport>(
        replica: ReplicaId,
        peers: &[ReplicaId],
        config: &NodeConfig,
        consensus: Arc<C>,
        transport: Arc<T>,
        inbound: mpsc::UnboundedReceiver<Operation>,
        metrics: Arc<dyn RouterMetrics>,
    ) -> Result<Self, RhizoError> {
        Self::start(replica, peers, config, consensus, transport, inbound, metrics, None)
    }

    /// Start a replica from a peer's snapshot. The background applier
    /// replays the committed log from the snapshot's cursor.
    ///
    /// The snapshot is installed before any task runs, so gossip already
    /// queued on `inbound` is merged on top of it rather than overwritten.
    pub fn init_from_snapshot<T: GossipTransport>(
        replica: ReplicaId,
        peers: &[ReplicaId],
        config: &NodeConfig,
        consensus: Arc<C>,
        transport: Arc<T>,
        inbound: mpsc::UnboundedReceiver<Operation>,
        snapshot: Snapshot,
    ) -> Result<Self, RhizoError> {
        Self::start(replica, peers, config, consensus, transport, inbound, Arc::new(NoopMetrics), Some(snapshot))
    }

    #[allow(clippy::too_many_arguments)]
    fn start<T: GossipTransport>(
        replica: ReplicaId,
        peers: &[ReplicaId],
        config: &NodeConfig,
        consensus: Arc<C>,
        transport: Arc<T>,
        inbound: mpsc::UnboundedReceiver<Operation>,
        metrics: Arc<dyn RouterMetrics>,
        snapshot: Option<Snapshot>,
    ) -> Result<Self, RhizoError> {
        let classifier = Arc::new(Classifier::from_config(&config.classification)?);
        let store = Arc::new(MemReplicaStore::new(replica));
        if let Some(snapshot) = snapshot {
            let from = snapshot.meta.replica;
            let cursor = snapshot.meta.last_applied;
            store.install_snapshot(snapshot)?;
            tracing::info!(replica, from, cursor, "installed snapshot");
        }
        let peers: Vec<ReplicaId> = peers.iter().copied().filter(|&p| p != replica).collect();

        let gossip = Arc::new(Gossip::start(transport, &peers, &config.gossip));
        let fast = Arc::new(
            CoordinationFreeEngine::new(replica, classifier.clone(), store.clone()).with_gossip(gossip.clone()),
        );
        let applier = Arc::new(CommittedLogApplier::new(consensus.clone(), store.clone(), classifier.clone()));
        let gateway = Arc::new(ConsensusGateway::new(consensus, applier.clone(), config.consensus.clone()));
        let families = classifier.families().len();
        let router =
            TransactionRouter::new(classifier, fast.clone(), gateway, config.router.clone()).with_metrics(metrics);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let poll = Duration::from_millis(config.consensus.apply_poll_interval_ms.max(1));
        let applier_task = tokio::spawn(applier.clone().run(poll, shutdown_rx));
        let receiver_task = tokio::spawn(fast.run_inbound(inbound));

        tracing::info!(replica, ?peers, families, policy = ?config.router.mixed_batch_policy, "node started");

        Ok(Node { replica, store, applier, router, gossip, shutdown, applier_task, receiver_task })
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn router(&self) -> &TransactionRouter<MemReplicaStore, C> {
        &self.router
    }

    pub fn store(&self) -> &Arc<MemReplicaStore> {
        &self.store
    }

    pub fn read(&self, key: &str) -> Option<KeyState> {
        self.store.get(key)
    }

    pub async fn submit(&self, batch: Batch) -> Result<Vec<CommitRecord>, RhizoError> {
        self.router.submit(batch).await
    }

    pub async fn submit_with_timeout(
        &self,
        batch: Batch,
        timeout: Duration,
    ) -> Result<Vec<CommitRecord>, RhizoError> {
        self.router.submit_with_timeout(batch, timeout).await
    }

    /// Apply every entry the consensus service has committed so far.
    pub async fn catch_up(&self) -> Result<u64, RhizoError> {
        self.applier.catch_up().await
    }

    /// Capture this replica's state for bootstrapping another one with
    /// [`Node::init_from_snapshot`].
    pub async fn snapshot(&self) -> Result<Snapshot, RhizoError> {
        self.applier.snapshot().await
    }

    /// Drain gossip and stop background tasks.
    pub async fn shutdown(self) {
        let cancelled = self.gossip.shutdown().await;
        let _ = self.shutdown.send(true);
        if let Err(e) = self.applier_task.await {
            tracing::warn!(replica = self.replica, error = %e, "applier task ended abnormally");
        }
        self.receiver_task.abort();
        tracing::info!(replica = self.replica, cancelled, "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use rhizo_classifier::FamilyConfig;
    use rhizo_consensus::StubConsensusService;
    use rhizo_types::{OperationKind, Payload, Value};

    use super::*;
    use crate::gossip::InMemoryNetwork;

    fn config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.classification.families = vec![
            FamilyConfig { name: "scores".into(), prefix: "score:".into(), kinds: vec![OperationKind::Max] },
            FamilyConfig { name: "counters".into(), prefix: "count:".into(), kinds: vec![OperationKind::Add] },
        ];
        config
    }

    fn add(origin: ReplicaId, v: i64) -> Operation {
        Operation::new(origin, 0, ["count:a"], OperationKind::Add, Payload::Value(Value::Int(v)))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn init_rejects_conflicting_schema() {
        let mut config = config();
        config.classification.families.push(FamilyConfig {
            name: "mixed".into(),
            prefix: "mixed:".into(),
            kinds: vec![OperationKind::Max, OperationKind::Overwrite],
        });
        let net = InMemoryNetwork::new();
        let (transport, inbound) = net.join(1);
        let svc = Arc::new(StubConsensusService::new());

        let err = Node::init(1, &[1, 2], &config, svc, Arc::new(transport), inbound).err().unwrap();
        assert!(matches!(err, RhizoError::SchemaConflict { .. }));
    }

    #[tokio::test]
    async fn snapshot_bootstraps_a_new_replica() {
        let net = InMemoryNetwork::new();
        let svc = Arc::new(StubConsensusService::new());
        let (t1, rx1) = net.join(1);
        let a = Node::init(1, &[], &config(), svc.clone(), Arc::new(t1), rx1).unwrap();

        let counted = add(1, 3);
        a.submit(vec![Operation::new(1, 0, ["score:a"], OperationKind::Max, Payload::Value(Value::Int(4)))])
            .await
            .unwrap();
        a.submit(vec![counted.clone()]).await.unwrap();
        a.submit(vec![Operation::new(1, 0, ["doc"], OperationKind::Overwrite, Payload::Value(Value::Int(1)))])
            .await
            .unwrap();
        let snapshot = a.snapshot().await.unwrap();
        // Committed after the snapshot was taken; replayed from the log.
        a.submit(vec![Operation::new(1, 0, ["doc"], OperationKind::Overwrite, Payload::Value(Value::Int(2)))])
            .await
            .unwrap();

        let (t2, rx2) = net.join(2);
        let b = Node::init_from_snapshot(2, &[], &config(), svc.clone(), Arc::new(t2), rx2, snapshot).unwrap();
        b.catch_up().await.unwrap();

        assert_eq!(b.read("score:a").unwrap().value, Some(Value::Int(4)));
        assert_eq!(b.read("doc").unwrap().value, Some(Value::Int(2)));

        // Dedup history travels with the snapshot: a late redelivery of a
        // counted delta is ignored.
        let (relay, _rx) = net.join(9);
        relay.send(2, counted).await.unwrap();
        relay.send(2, add(1, 5)).await.unwrap();
        eventually(|| b.read("count:a").and_then(|s| s.value) == Some(Value::Int(8))).await;
        assert_eq!(b.read("count:a").unwrap().version, 2);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn gossip_queued_before_bootstrap_survives_install() {
        let net = InMemoryNetwork::new();
        let svc = Arc::new(StubConsensusService::new());
        let (t1, rx1) = net.join(1);
        let a = Node::init(1, &[], &config(), svc.clone(), Arc::new(t1), rx1).unwrap();
        a.submit(vec![add(1, 3)]).await.unwrap();
        let snapshot = a.snapshot().await.unwrap();

        // Replica 2 is reachable before it has started: these sit in its inbox.
        let (t2, rx2) = net.join(2);
        let (relay, _rx) = net.join(3);
        relay.send(2, add(3, 4)).await.unwrap();
        relay
            .send(2, Operation::new(3, 0, ["score:b"], OperationKind::Max, Payload::Value(Value::Int(7))))
            .await
            .unwrap();

        let b = Node::init_from_snapshot(2, &[], &config(), svc, Arc::new(t2), rx2, snapshot).unwrap();
        eventually(|| {
            b.read("count:a").and_then(|s| s.value) == Some(Value::Int(7))
                && b.read("score:b").and_then(|s| s.value) == Some(Value::Int(7))
        })
        .await;

        a.shutdown().await;
        b.shutdown().await;
    }
}
