//! Whole-server replication tests over live loopback sockets.
//!
//! These start real coordinators with real RPC servers and sender
//! threads. Timing is wall clock, so assertions poll with generous
//! deadlines rather than assuming exact schedules.

use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use lattice_core::{Gid, NodeId, TxId, WorkerId};
use lattice_durability::StateDelta;
use lattice_server::{Coordinator, ServerConfig};

/// Reserves `n` distinct loopback addresses.
fn free_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap())
        .collect()
}

fn cluster_config(
    node_id: u64,
    addrs: &[SocketAddr],
    dir: &std::path::Path,
) -> ServerConfig {
    let mut config = ServerConfig::single_node(
        NodeId::new(node_id),
        WorkerId::new(node_id - 1),
        addrs[(node_id - 1) as usize],
        dir.join(format!("node-{node_id}")),
    );
    config.peers = addrs
        .iter()
        .enumerate()
        .map(|(i, &addr)| (NodeId::new(i as u64 + 1), addr))
        .collect();
    config.raft.election_timeout_min_ms = 150;
    config.raft.election_timeout_max_ms = 300;
    config.raft.heartbeat_interval_ms = 50;
    config.raft.commit_timeout = Duration::from_secs(3);
    config.rpc.call_timeout_ms = 300;
    config.durability.snapshot_period = Duration::from_secs(3600);
    config
}

/// Polls until the closure yields `Some`, or panics at the deadline.
fn wait_for<T>(deadline: Duration, what: &str, mut probe: impl FnMut() -> Option<T>) -> T {
    let started = Instant::now();
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(started.elapsed() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn leader_index(nodes: &[Coordinator]) -> Option<usize> {
    nodes.iter().position(Coordinator::is_leader)
}

fn create_vertex(tx: TxId, gid: u64) -> StateDelta {
    StateDelta::CreateVertex {
        tx,
        vertex: Gid::new(gid),
    }
}

#[test]
fn test_cluster_elects_and_replicates() {
    let dir = tempfile::tempdir().unwrap();
    let addrs = free_addrs(3);

    let nodes: Vec<Coordinator> = (1..=3)
        .map(|id| Coordinator::open(cluster_config(id, &addrs, dir.path())).unwrap())
        .collect();

    // A leader appears within a couple of election windows.
    let leader = wait_for(Duration::from_secs(5), "leader election", || {
        leader_index(&nodes)
    });

    // A replicated commit becomes visible on every peer.
    let tx = nodes[leader].begin();
    nodes[leader].buffer(create_vertex(tx.id, 7));
    nodes[leader].commit(&tx).unwrap();

    for node in &nodes {
        wait_for(Duration::from_secs(5), "replication", || {
            node.with_graph(|g| g.has_vertex(Gid::new(7))).then_some(())
        });
    }
}

#[test]
fn test_follower_refuses_writes_with_hint() {
    let dir = tempfile::tempdir().unwrap();
    let addrs = free_addrs(3);

    let nodes: Vec<Coordinator> = (1..=3)
        .map(|id| Coordinator::open(cluster_config(id, &addrs, dir.path())).unwrap())
        .collect();

    let leader = wait_for(Duration::from_secs(5), "leader election", || {
        leader_index(&nodes)
    });
    let follower = (leader + 1) % nodes.len();

    let tx = nodes[follower].begin();
    nodes[follower].buffer(create_vertex(tx.id, 1));
    let result = nodes[follower].commit(&tx);

    match result {
        Err(lattice_server::ServerError::NotLeader { leader_hint }) => {
            // The hint, when present, names the actual leader.
            if let Some(hint) = leader_hint {
                assert_eq!(hint, NodeId::new(leader as u64 + 1));
            }
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }
}

#[test]
fn test_new_leader_after_crash() {
    // Scenario E4 over real sockets: kill the leader, a new one takes
    // over within a couple of election windows and accepts writes.
    let dir = tempfile::tempdir().unwrap();
    let addrs = free_addrs(3);

    let mut nodes: Vec<Option<Coordinator>> = (1..=3)
        .map(|id| Some(Coordinator::open(cluster_config(id, &addrs, dir.path())).unwrap()))
        .collect();

    let leader = wait_for(Duration::from_secs(5), "leader election", || {
        nodes
            .iter()
            .position(|n| n.as_ref().is_some_and(Coordinator::is_leader))
    });

    // Crash the leader.
    nodes[leader] = None;

    let new_leader = wait_for(Duration::from_secs(5), "re-election", || {
        nodes
            .iter()
            .position(|n| n.as_ref().is_some_and(Coordinator::is_leader))
    });
    assert_ne!(new_leader, leader);

    // The survivor majority accepts and replicates writes. A retried
    // attempt uses a fresh vertex id: an aborted-but-replicated entry may
    // still apply later, and ids are never reused.
    let node = nodes[new_leader].as_ref().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut attempt = 0u64;
    let written = loop {
        let gid = 100 + attempt;
        attempt += 1;
        let tx = node.begin();
        node.buffer(create_vertex(tx.id, gid));
        match node.commit(&tx) {
            Ok(()) => break gid,
            Err(e) if e.is_retryable() && Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("write on new leader failed: {e}"),
        }
    };
    assert!(node.with_graph(|g| g.has_vertex(Gid::new(written))));
}
