//! Multi-node scenarios over the in-memory network.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use murmur::config::{MurmurConfig, MurmurConfigBuilder};
use murmur::{MemoryNetwork, Murmur, NodeState, NoopEventDelegate, SharedValueDelegate};
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);

struct TestNode {
    murmur: Murmur,
    store: Arc<SharedValueDelegate>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config(name: &str) -> Result<MurmurConfig> {
    MurmurConfigBuilder::new()
        .with_name(name)
        .with_probing_interval(Duration::from_millis(100))
        .with_ack_timeout(Duration::from_millis(20))
        .with_indirect_ack_timeout(Duration::from_millis(30))
        .with_suspicious_timeout(Duration::from_millis(200))
        .with_gossip_interval(Duration::from_millis(30))
        .with_push_pull_interval(Duration::from_millis(300))
        .with_stream_timeout(Duration::from_millis(200))
        .with_member_log_interval(None)
        .build()
}

async fn spawn_node(network: &MemoryNetwork, name: &str) -> Result<TestNode> {
    spawn_node_with(network, fast_config(name)?, 4).await
}

// `mult` scales how many times the shared value is retransmitted.
async fn spawn_node_with(network: &MemoryNetwork, config: MurmurConfig, mult: u32) -> Result<TestNode> {
    let store = Arc::new(SharedValueDelegate::new(config.name(), mult));
    let murmur = Murmur::new(
        config,
        store.clone(),
        Arc::new(NoopEventDelegate),
        Arc::new(network.bind()),
    )?;
    store.bind_member_count(murmur.member_counter());
    murmur.start().await?;
    Ok(TestNode { murmur, store })
}

async fn spawn_cluster(network: &MemoryNetwork, size: usize) -> Result<Vec<TestNode>> {
    spawn_cluster_with(network, size, fast_config, 4).await
}

// Starts `size` nodes, every one joining through the first.
async fn spawn_cluster_with(
    network: &MemoryNetwork,
    size: usize,
    config: fn(&str) -> Result<MurmurConfig>,
    mult: u32,
) -> Result<Vec<TestNode>> {
    let seed = spawn_node_with(network, config("node-0")?, mult).await?;
    assert_eq!(seed.murmur.join(&[]).await?, 0);
    let seed_addr = seed.murmur.local_addr();

    let mut nodes = vec![seed];
    for i in 1..size {
        let node = spawn_node_with(network, config(&format!("node-{}", i))?, mult).await?;
        assert_eq!(node.murmur.join(&[seed_addr]).await?, 1);
        nodes.push(node);
    }
    Ok(nodes)
}

async fn eventually<F>(check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn state_of(node: &TestNode, name: &str) -> Option<NodeState> {
    node.murmur
        .snapshot()
        .into_iter()
        .find(|member| member.name == name)
        .map(|member| member.state())
}

async fn shutdown_all(nodes: &[TestNode]) -> Result<()> {
    for node in nodes {
        node.murmur.shutdown().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_share_a_value() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, 3).await?;
    assert!(eventually(|| nodes.iter().all(|node| node.murmur.num_members() == 3)).await);

    nodes[0].store.set_value("hello");
    assert_eq!(nodes[0].store.get_value(), "hello");
    assert!(eventually(|| nodes.iter().all(|node| node.store.get_value() == "hello")).await);

    // a later write from another member replaces it everywhere
    nodes[2].store.set_value("world");
    assert!(eventually(|| nodes.iter().all(|node| node.store.get_value() == "world")).await);

    shutdown_all(&nodes).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_killed_node_is_declared_dead() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, 4).await?;
    assert!(eventually(|| nodes.iter().all(|node| node.murmur.num_members() == 4)).await);

    assert!(network.kill(nodes[3].murmur.local_addr()));

    let survivors = &nodes[..3];
    assert!(eventually(|| {
        survivors.iter().all(|node| state_of(node, "node-3") == Some(NodeState::Dead))
    }).await);
    for node in survivors {
        assert_eq!(node.murmur.num_members(), 3);
        assert!(node.murmur.local_node().is_some_and(|local| local.is_alive()));
    }

    shutdown_all(&nodes).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_membership_converges_in_larger_cluster() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, 8).await?;

    assert!(eventually(|| nodes.iter().all(|node| node.murmur.num_members() == 8)).await);
    for node in &nodes {
        let names: Vec<String> = node.murmur.members().into_iter().map(|member| member.name).collect();
        let expected: Vec<String> = (0..8).map(|i| format!("node-{}", i)).collect();
        assert_eq!(names, expected);
    }

    shutdown_all(&nodes).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departure_is_disseminated() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, 3).await?;
    assert!(eventually(|| nodes.iter().all(|node| node.murmur.num_members() == 3)).await);

    nodes[2].murmur.shutdown().await?;
    assert!(!nodes[2].murmur.is_running());

    let remaining = &nodes[..2];
    assert!(eventually(|| {
        remaining.iter().all(|node| state_of(node, "node-2") == Some(NodeState::Left))
    }).await);

    shutdown_all(remaining).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_value_spreads_despite_packet_loss() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    // ceil(10 * log10(6)) = 8 copies per node outlast a 10% loss
    let nodes = spawn_cluster_with(&network, 5, fast_config, 10).await?;
    assert!(eventually(|| nodes.iter().all(|node| node.murmur.num_members() == 5)).await);

    network.set_drop_rate(0.1);
    nodes[1].store.set_value("lossy");
    assert!(eventually(|| nodes.iter().all(|node| node.store.get_value() == "lossy")).await);

    network.set_drop_rate(0.0);
    shutdown_all(&nodes).await
}

// Roomier timeouts: the indirect path crosses three scheduler hops.
fn relay_config(name: &str) -> Result<MurmurConfig> {
    MurmurConfigBuilder::new()
        .with_name(name)
        .with_probing_interval(Duration::from_millis(200))
        .with_ack_timeout(Duration::from_millis(40))
        .with_indirect_ack_timeout(Duration::from_millis(120))
        .with_suspicious_timeout(Duration::from_millis(400))
        .with_gossip_interval(Duration::from_millis(30))
        .with_push_pull_interval(Duration::from_millis(300))
        .with_stream_timeout(Duration::from_millis(200))
        .with_member_log_interval(None)
        .build()
}

fn view(node: &TestNode) -> Vec<(String, NodeState, u64)> {
    node.murmur
        .snapshot()
        .into_iter()
        .map(|member| (member.name.clone(), member.state(), member.incarnation()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cut_link_is_bridged_by_indirect_pings() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster_with(&network, 3, relay_config, 4).await?;
    assert!(eventually(|| {
        nodes.iter().all(|node| {
            let view = view(node);
            view.len() == 3 && view.iter().all(|(_, state, _)| *state == NodeState::Alive)
        })
    }).await);
    let before: Vec<_> = nodes.iter().map(view).collect();

    // node-0 and node-2 only reach each other through node-1 from now on
    network.block(nodes[0].murmur.local_addr(), nodes[2].murmur.local_addr());
    sleep(Duration::from_millis(1_500)).await;

    // any suspicion would show up as a state change or a refutation bump
    let after: Vec<_> = nodes.iter().map(view).collect();
    assert_eq!(before, after);

    network.unblock(nodes[0].murmur.local_addr(), nodes[2].murmur.local_addr());
    shutdown_all(&nodes).await
}

#[tokio::test]
async fn test_joining_node_adopts_current_value() -> Result<()> {
    let network = MemoryNetwork::new();
    let seed = spawn_node(&network, "seed").await?;
    seed.store.set_value("before-join");

    let late = spawn_node(&network, "late").await?;
    late.murmur.join(&[seed.murmur.local_addr()]).await?;
    assert_eq!(late.store.get_value(), "before-join");

    shutdown_all(&[seed, late]).await
}

#[tokio::test]
async fn test_join_without_reachable_seed_fails() -> Result<()> {
    let network = MemoryNetwork::new();
    let node = spawn_node(&network, "alone").await?;
    let nowhere = "127.0.0.1:1".parse::<std::net::SocketAddr>()?;

    let err = node.murmur.join(&[nowhere]).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<murmur::MurmurError>(), Some(murmur::MurmurError::Startup(_))));

    node.murmur.shutdown().await
}
