use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use raft_core::{ElectionTimer, NodeId, NodeState, Status};
use raft_runtime::{
    ConsensusNode, Error, KvCommand, KvStore, LocalNetwork, NodeConfig, RaftHandle, SubmitOutcome,
};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Runs an in-process cluster, replicates a few commands, kills the leader
/// and replicates a few more.
#[derive(Parser, Debug)]
#[command(name = "raft-cluster")]
#[command(version)]
#[command(about = "Run a local Raft cluster over an in-process network")]
struct Args {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Commands to submit before and after the leader is killed
    #[arg(long, default_value = "5")]
    commands: usize,

    /// Keep each node's state in <DATA_DIR>/node-<id> instead of memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seed election timers and message loss for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Probability that any single message is lost
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,

    /// Node settings (timeouts, batch size) as JSON; `id` and `members` are ignored
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct NodeReport {
    #[serde(flatten)]
    status: Status,
    data: BTreeMap<String, String>,
}

struct Member {
    handle: RaftHandle,
    store: KvStore,
}

type AnyError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.data_dir.clone() {
        Some(dir) => run(args, |id| FileStorage::new(dir.join(format!("node-{id}")))).await,
        None => run(args, |_| Ok(InMemoryStorage::new())).await,
    }
}

async fn run<S, F>(args: Args, open_storage: F) -> Result<(), AnyError>
where
    S: Storage + Send + 'static,
    F: Fn(NodeId) -> raft_storage::Result<S>,
{
    if args.nodes == 0 {
        return Err("a cluster needs at least one node".into());
    }
    let template = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::new(1),
    };
    let members: Vec<NodeId> = (1..=args.nodes).collect();

    let network = match args.seed {
        Some(seed) => LocalNetwork::seeded(seed),
        None => LocalNetwork::new(),
    };
    network.set_drop_rate(args.drop_rate).await;

    let mut cluster = BTreeMap::new();
    for &id in &members {
        let config = NodeConfig {
            id,
            members: members.clone(),
            data_dir: None,
            raft: template.raft.clone(),
        };
        let store = KvStore::new();
        let mut node = ConsensusNode::new(&config, open_storage(id)?, network.transport(id), store.clone())?;
        if let Some(seed) = args.seed {
            node = node.with_election_timer(ElectionTimer::seeded(&config.raft, seed.wrapping_add(id)));
        }
        let handle = node.spawn();
        network.register(handle.clone()).await;
        cluster.insert(id, Member { handle, store });
    }
    tracing::info!(nodes = args.nodes, "Cluster started");

    let leader = wait_for_leader(&cluster).await?;
    println!("node {leader} is leader");
    submit_batch(&cluster, leader, "before", args.commands).await?;

    if cluster.len() > 1 {
        if let Some(old) = cluster.remove(&leader) {
            old.handle.shutdown().await;
            network.unregister(leader).await;
            println!("killed leader {leader}");
        }
        let leader = wait_for_leader(&cluster).await?;
        println!("node {leader} is leader");
        submit_batch(&cluster, leader, "after", args.commands).await?;
    }

    // let followers catch up on the last commit index
    tokio::time::sleep(template.raft.heartbeat_interval() * 3).await;

    let mut reports = Vec::new();
    for member in cluster.values() {
        reports.push(NodeReport {
            status: member.handle.status().await?,
            data: member.store.snapshot(),
        });
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);

    for member in cluster.values() {
        member.handle.shutdown().await;
    }
    Ok(())
}

/// Poll until some live node reports itself leader.
async fn wait_for_leader(cluster: &BTreeMap<NodeId, Member>) -> Result<NodeId, AnyError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        for (&id, member) in cluster {
            if let Ok(status) = member.handle.status().await {
                if status.state == NodeState::Leader {
                    return Ok(id);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err("no leader elected within 10s".into())
}

async fn submit_batch(
    cluster: &BTreeMap<NodeId, Member>,
    mut leader: NodeId,
    prefix: &str,
    count: usize,
) -> Result<(), AnyError> {
    for i in 0..count {
        let command = KvCommand::set(format!("{prefix}-{i}"), i.to_string());
        let outcome = loop {
            let member = cluster.get(&leader).ok_or("leader is not a live member")?;
            match member.handle.submit(command.to_bytes()).await {
                Err(Error::NotLeader(Some(hint))) if hint != leader && cluster.contains_key(&hint) => {
                    leader = hint;
                }
                Err(Error::NotLeader(_)) => {
                    leader = wait_for_leader(cluster).await?;
                }
                other => break other?,
            }
        };
        report(&command, outcome);
    }
    Ok(())
}

fn report(command: &KvCommand, outcome: SubmitOutcome) {
    if outcome.committed {
        println!("committed  #{:<4} {command}", outcome.index);
    } else {
        println!("abandoned  #{:<4} {command}", outcome.index);
    }
}
