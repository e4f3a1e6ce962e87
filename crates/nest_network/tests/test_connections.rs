use std::time::Duration;

use nest_network::{NestId, Network, NetworkConfig, Topology};

fn fast_config() -> NetworkConfig {
    NetworkConfig {
        latency_min: Duration::from_millis(1),
        latency_max: Duration::from_millis(1),
        ..NetworkConfig::default()
    }
}

fn build(config: NetworkConfig) -> Network {
    let network = Topology::from_edges(&["A-B", "B-C", "C-D", "B-E"])
        .unwrap()
        .build(config)
        .unwrap();
    network.start();
    network
}

fn id(name: &str) -> NestId {
    NestId::from(name)
}

#[tokio::test(start_paused = true)]
async fn test_every_nest_learns_every_adjacency() {
    let network = build(fast_config());
    assert!(!network.is_converged());
    network.broadcast_all_connections().unwrap();
    assert!(network.wait_for_convergence(Duration::from_secs(5)).await);

    for nest in network.nests() {
        let table = nest.connections();
        assert_eq!(table.len(), 5, "{} knows {:?}", nest.id(), table.keys());
        assert_eq!(
            table[&id("B")].neighbors,
            [id("A"), id("C"), id("E")].into_iter().collect()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_newer_snapshot_replaces_older() {
    let network = build(fast_config());
    network.broadcast_all_connections().unwrap();
    assert!(network.wait_for_convergence(Duration::from_secs(5)).await);

    let sent = network.broadcast_connections(&id("D")).unwrap();
    assert_eq!(sent, 1);
    assert_eq!(network.nest(&id("D")).unwrap().clock(), 2);
    assert!(network.wait_for_convergence(Duration::from_secs(5)).await);

    for nest in network.nests() {
        assert_eq!(nest.connection(&id("D")).unwrap().timestamp, 2);
    }
}

#[tokio::test(start_paused = true)]
async fn test_tree_delivers_each_snapshot_once() {
    let network = build(fast_config());
    network.broadcast_all_connections().unwrap();
    assert!(network.wait_for_convergence(Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = network.nest(&id("B")).unwrap().stats();
    assert_eq!(stats.snapshots_accepted, 4);
    assert_eq!(stats.snapshots_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cycle_drops_known_snapshots() {
    let network = Topology::from_edges(&["A-B", "B-C", "C-A"])
        .unwrap()
        .build(fast_config())
        .unwrap();
    network.start();
    network.broadcast_connections(&id("A")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // B and C each hear A's snapshot from A and again from each other.
    let dropped: u64 = network
        .nests()
        .iter()
        .map(|n| n.stats().snapshots_dropped)
        .sum();
    assert_eq!(dropped, 2);
    for name in ["B", "C"] {
        let nest = network.nest(&id(name)).unwrap();
        assert_eq!(nest.stats().snapshots_accepted, 1);
        assert_eq!(nest.connection(&id("A")).unwrap().timestamp, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_periodic_rebroadcast() {
    let config = NetworkConfig {
        connections_interval: Some(Duration::from_millis(100)),
        ..fast_config()
    };
    let network = build(config);
    assert!(network.wait_for_convergence(Duration::from_secs(5)).await);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(network.nest(&id("A")).unwrap().clock() >= 3);
    network.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_from_unknown_nest() {
    let network = build(fast_config());
    assert!(network.broadcast_connections(&id("Z")).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_convergence_survives_loss() {
    let config = NetworkConfig {
        loss_rate: 0.1,
        ..fast_config()
    };
    let network = Topology::crow_nests().build(config).unwrap();
    network.start();
    network.broadcast_all_connections().unwrap();
    assert!(network.wait_for_convergence(Duration::from_secs(5)).await);

    let expected = network.nest_ids().len();
    for nest in network.nests() {
        assert_eq!(nest.connections().len(), expected, "{}", nest.id());
    }
}
