use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use rhizo_consensus::StubConsensusService;
use rhizo_engine::{InMemoryNetwork, Node, NodeConfig};
use rhizo_types::{Operation, OperationKind, Payload, ReplicaId, Value};

#[derive(clap::Parser, Debug)]
#[command(
    name = "rhizo-node",
    about = "Runs a local Rhizo cluster in one process over an in-memory network and a stub consensus service"
)]
struct Cli {
    /// Id of the first replica; the others follow consecutively.
    #[arg(long, default_value_t = 1)]
    node_id: ReplicaId,
    /// Number of in-process replicas. Overrides `cluster.replicas`.
    #[arg(long)]
    replicas: Option<u64>,
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Submit a sample batch on each commit path after startup and log the records.
    #[arg(long)]
    demo: bool,
}

#[derive(Debug, Deserialize)]
struct ClusterConfig {
    replicas: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    cluster: ClusterConfig,
    observability: ObservabilityConfig,
    #[serde(flatten)]
    node: NodeConfig,
}

fn figment(config_path: Option<&std::path::Path>) -> Figment {
    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file_exact(path));
    }
    figment.merge(Env::prefixed("RHIZO_").split("__"))
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Submit one coordination-free batch and one coordinated batch through
/// `node`, logging every record.
async fn run_demo(node: &Node<StubConsensusService>) -> anyhow::Result<()> {
    let origin = node.replica();
    let algebraic = vec![
        Operation::new(origin, now_millis(), ["score:demo"], OperationKind::Max, Payload::Value(Value::Int(42))),
        Operation::new(origin, now_millis(), ["count:demo"], OperationKind::Add, Payload::Value(Value::Int(1))),
    ];
    let generic = vec![Operation::new(
        origin,
        now_millis(),
        ["doc:demo"],
        OperationKind::Overwrite,
        Payload::Value(Value::Text("hello".into())),
    )];

    for batch in [algebraic, generic] {
        let records = node.submit(batch).await.context("demo batch refused")?;
        for record in records {
            tracing::info!(
                op_id = %record.op_id,
                path = ?record.path,
                accepted = record.accepted,
                order = ?record.order,
                values = ?record.values,
                "demo commit"
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let config: Config = figment(cli.config.as_deref())
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let replicas = cli.replicas.unwrap_or(config.cluster.replicas);
    anyhow::ensure!(replicas > 0, "at least one replica is required");
    let ids: Vec<ReplicaId> = (cli.node_id..cli.node_id + replicas).collect();

    tracing::info!(
        first = cli.node_id,
        replicas,
        policy = ?config.node.router.mixed_batch_policy,
        "cluster starting"
    );

    let consensus = Arc::new(StubConsensusService::new());
    let network = InMemoryNetwork::new();
    let mut nodes = Vec::with_capacity(ids.len());
    for &id in &ids {
        let (transport, inbound) = network.join(id);
        let node = Node::init(id, &ids, &config.node, consensus.clone(), Arc::new(transport), inbound)
            .with_context(|| format!("failed to start replica {id}"))?;
        nodes.push(node);
    }

    if cli.demo {
        if let Some(first) = nodes.first() {
            run_demo(first).await?;
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    for node in nodes {
        node.shutdown().await;
    }
    Ok(())
}
