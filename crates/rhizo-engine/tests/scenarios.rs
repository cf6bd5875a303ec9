use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rhizo_classifier::FamilyConfig;
use rhizo_consensus::StubConsensusService;
use rhizo_engine::{CountingMetrics, InMemoryNetwork, MixedBatchPolicy, Node, NodeConfig};
use rhizo_types::{
    AlgebraicClass, CommitPath, Operation, OperationKind, Payload, RejectReason, ReplicaId, RhizoError, Value,
};

struct Cluster {
    net: Arc<InMemoryNetwork>,
    svc: Arc<StubConsensusService>,
    nodes: Vec<Node<StubConsensusService>>,
}

impl Cluster {
    fn start(size: u64, svc: StubConsensusService) -> Self {
        Self::start_with(size, svc, config())
    }

    fn start_with(size: u64, svc: StubConsensusService, config: NodeConfig) -> Self {
        let net = InMemoryNetwork::new();
        let svc = Arc::new(svc);
        let ids: Vec<ReplicaId> = (1..=size).collect();
        let nodes = ids
            .iter()
            .map(|&id| {
                let (transport, inbound) = net.join(id);
                Node::init(id, &ids, &config, svc.clone(), Arc::new(transport), inbound).unwrap()
            })
            .collect();
        Cluster { net, svc, nodes }
    }

    fn node(&self, id: ReplicaId) -> &Node<StubConsensusService> {
        &self.nodes[(id - 1) as usize]
    }

    fn values(&self, key: &str) -> Vec<Option<Value>> {
        self.nodes.iter().map(|n| n.read(key).and_then(|s| s.value)).collect()
    }

    async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}

fn config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.gossip.max_backoff_ms = 100;
    config.classification.families = vec![
        FamilyConfig { name: "scores".into(), prefix: "score:".into(), kinds: vec![OperationKind::Max] },
        FamilyConfig { name: "counters".into(), prefix: "count:".into(), kinds: vec![OperationKind::Add] },
        FamilyConfig { name: "tags".into(), prefix: "tags:".into(), kinds: vec![OperationKind::Union] },
        FamilyConfig {
            name: "docs".into(),
            prefix: "doc:".into(),
            kinds: vec![OperationKind::Overwrite, OperationKind::CompareAndSwap, OperationKind::Delete],
        },
    ];
    config
}

fn op(origin: ReplicaId, key: &str, kind: OperationKind, payload: Payload) -> Operation {
    Operation::new(origin, 0, [key], kind, payload)
}

fn int(v: i64) -> Payload {
    Payload::Value(Value::Int(v))
}

fn text(v: &str) -> Payload {
    Payload::Value(Value::Text(v.into()))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn max_converges_regardless_of_arrival_order() {
    let cluster = Cluster::start(2, StubConsensusService::new());

    // Each replica applies its own write first and the other's second.
    cluster.node(1).submit(vec![op(1, "score:ts", OperationKind::Max, int(5))]).await.unwrap();
    cluster.node(2).submit(vec![op(2, "score:ts", OperationKind::Max, int(9))]).await.unwrap();

    let want = Some(Value::Int(9));
    eventually("max to converge", || cluster.values("score:ts") == vec![want.clone(), want.clone()]).await;
    assert_eq!(cluster.svc.proposals(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_adds_apply_exactly_once() {
    let cluster = Cluster::start(2, StubConsensusService::new());
    cluster.net.set_duplicate_delivery(true);

    let (a, b) = tokio::join!(
        cluster.node(1).submit(vec![op(1, "count:hits", OperationKind::Add, int(3))]),
        cluster.node(2).submit(vec![op(2, "count:hits", OperationKind::Add, int(4))]),
    );
    assert!(a.unwrap()[0].accepted);
    assert!(b.unwrap()[0].accepted);

    let want = Some(Value::Int(7));
    eventually("adds to converge", || cluster.values("count:hits") == vec![want.clone(), want.clone()]).await;

    // Duplicates still in flight must not change the total.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.values("count:hits"), vec![want.clone(), want]);
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn overwrite_without_quorum_is_rejected_in_time() {
    let svc = StubConsensusService::with_round_trip(Duration::from_millis(100));
    svc.set_reachable(false);
    let mut config = config();
    config.consensus.max_attempts = 1_000;
    let cluster = Cluster::start_with(2, svc, config);

    let start = Instant::now();
    let records = cluster
        .node(1)
        .submit_with_timeout(vec![op(1, "doc:k", OperationKind::Overwrite, text("x"))], Duration::from_secs(2))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(!records[0].accepted);
    assert!(matches!(records[0].reason, Some(RejectReason::ConsensusUnavailable { .. })));
    assert!(elapsed >= Duration::from_millis(1_900), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2_010), "{elapsed:?}");
    assert_eq!(cluster.values("doc:k"), vec![None, None]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn mixed_batch_is_rejected_with_nothing_applied() {
    let mut config = config();
    config.router.mixed_batch_policy = MixedBatchPolicy::Reject;
    let cluster = Cluster::start_with(2, StubConsensusService::new(), config);

    let err = cluster
        .node(1)
        .submit(vec![
            op(1, "score:k", OperationKind::Max, int(5)),
            op(1, "score:k", OperationKind::Overwrite, text("x")),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, RhizoError::MixedClassBatch { .. }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.values("score:k"), vec![None, None]);
    assert_eq!(cluster.svc.proposals(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn unknown_kind_is_generic_and_coordinated() {
    let cluster = Cluster::start(2, StubConsensusService::new());
    let foo = OperationKind::from("FOO");
    assert_eq!(cluster.node(1).router().classifier().classify(&foo), AlgebraicClass::Generic);

    let records = cluster.node(1).submit(vec![op(1, "misc", foo, text("bar"))]).await.unwrap();
    assert_eq!(records[0].path, CommitPath::Consensus);
    assert!(records[0].accepted);

    cluster.node(2).catch_up().await.unwrap();
    let want = Some(Value::Text("bar".into()));
    assert_eq!(cluster.values("misc"), vec![want.clone(), want]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn generic_writes_converge_on_one_order() {
    let cluster = Cluster::start(3, StubConsensusService::new());

    let writer = |id: ReplicaId| {
        let node = cluster.node(id);
        async move {
            for n in 0..10 {
                let v = format!("{id}-{n}");
                node.submit(vec![op(id, "doc:shared", OperationKind::Overwrite, text(&v))]).await.unwrap();
            }
        }
    };
    tokio::join!(writer(1), writer(2), writer(3));

    for node in &cluster.nodes {
        node.catch_up().await.unwrap();
    }
    let values = cluster.values("doc:shared");
    assert!(values[0].is_some());
    assert!(values.iter().all(|v| *v == values[0]));
    assert_eq!(cluster.svc.committed_len().await, 30);
    cluster.shutdown().await;
}

#[tokio::test]
async fn generic_write_invisible_until_committed() {
    let cluster = Cluster::start(2, StubConsensusService::with_round_trip(Duration::from_millis(50)));

    let writer = cluster.node(1).submit(vec![op(1, "doc:k", OperationKind::Overwrite, text("x"))]);
    let observer = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster.values("doc:k")
    };
    let (records, seen) = tokio::join!(writer, observer);

    assert_eq!(seen, vec![None, None]);
    assert!(records.unwrap()[0].accepted);
    assert_eq!(cluster.node(1).read("doc:k").unwrap().value, Some(Value::Text("x".into())));
    cluster.shutdown().await;
}

#[tokio::test]
async fn partitioned_replicas_converge_after_heal() {
    let cluster = Cluster::start(3, StubConsensusService::new());
    cluster.net.partition(1, 2);
    cluster.net.partition(1, 3);

    let tag = Payload::Value(Value::set(["a"]));
    cluster.node(1).submit(vec![op(1, "tags:t", OperationKind::Union, tag)]).await.unwrap();
    let tag = Payload::Value(Value::set(["b"]));
    cluster.node(2).submit(vec![op(2, "tags:t", OperationKind::Union, tag)]).await.unwrap();
    cluster.node(3).submit(vec![op(3, "count:c", OperationKind::Add, int(2))]).await.unwrap();

    eventually("replicas 2 and 3 to exchange", || {
        cluster.node(3).read("tags:t").and_then(|s| s.value) == Some(Value::set(["b"]))
            && cluster.node(2).read("count:c").and_then(|s| s.value) == Some(Value::Int(2))
    })
    .await;
    assert_eq!(cluster.node(1).read("count:c"), None);

    cluster.net.heal_all();
    let tags = Some(Value::set(["a", "b"]));
    let count = Some(Value::Int(2));
    eventually("all replicas to converge", || {
        cluster.values("tags:t") == vec![tags.clone(), tags.clone(), tags.clone()]
            && cluster.values("count:c") == vec![count.clone(), count.clone(), count.clone()]
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fast_path_latency_does_not_include_round_trip() {
    let round_trip = Duration::from_millis(80);
    let net = InMemoryNetwork::new();
    let svc = Arc::new(StubConsensusService::with_round_trip(round_trip));
    let metrics = Arc::new(CountingMetrics::default());
    let (transport, inbound) = net.join(1);
    let node =
        Node::init_with_metrics(1, &[1], &config(), svc, Arc::new(transport), inbound, metrics.clone()).unwrap();

    let start = Instant::now();
    node.submit(vec![op(1, "score:a", OperationKind::Max, int(1))]).await.unwrap();
    let fast = start.elapsed();

    let start = Instant::now();
    node.submit(vec![op(1, "doc:a", OperationKind::Overwrite, text("x"))]).await.unwrap();
    let coordinated = start.elapsed();

    assert!(fast < round_trip, "{fast:?}");
    assert!(coordinated >= round_trip, "{coordinated:?}");
    assert!(metrics.mean_latency(CommitPath::Fast) < metrics.mean_latency(CommitPath::Consensus));
    node.shutdown().await;
}
