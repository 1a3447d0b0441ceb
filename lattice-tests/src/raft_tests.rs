//! Raft safety and liveness properties over the simulated cluster.

use lattice_core::{LogIndex, NodeId};
use lattice_raft::RaftRole;

use crate::cluster::{sample_delta, SimCluster};

fn node(id: u64) -> NodeId {
    NodeId::new(id)
}

/// Log matching: for all peers p, q and every index at or below both
/// commit indexes, the entries agree.
fn check_log_matching(cluster: &SimCluster, ids: &[u64]) {
    for &p in ids {
        for &q in ids {
            let peer_p = cluster.peer(node(p));
            let peer_q = cluster.peer(node(q));
            let bound = peer_p.commit_index().min(peer_q.commit_index());
            for i in 1..=bound.get() {
                let idx = LogIndex::new(i);
                let entry_p = peer_p.log().get(idx);
                let entry_q = peer_q.log().get(idx);
                if let (Some(a), Some(b)) = (entry_p, entry_q) {
                    assert_eq!(a, b, "logs diverge at index {i} between {p} and {q}");
                }
            }
        }
    }
}

#[test]
fn test_first_election_wins() {
    let mut cluster = SimCluster::new(3);

    cluster.elect(node(1));

    assert_eq!(cluster.leader(), Some(node(1)));
    assert_eq!(cluster.peer(node(1)).current_term().get(), 1);
}

#[test]
fn test_proposals_commit_and_replicate() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(node(1));

    for tx in 1..=5 {
        let index = cluster.propose(node(1), sample_delta(tx));
        assert!(index.is_some());
    }
    // Followers learn the final commit index from the next heartbeat.
    cluster.fire_heartbeat(node(1));

    // All peers applied all five entries, in identical order.
    for id in 1..=3u64 {
        let applied = cluster.applied(node(id));
        assert_eq!(applied.len(), 5, "peer {id}");
        for (i, (index, delta)) in applied.iter().enumerate() {
            assert_eq!(index.get(), i as u64 + 1);
            assert_eq!(delta, &sample_delta(i as u64 + 1));
        }
    }
    check_log_matching(&cluster, &[1, 2, 3]);
}

#[test]
fn test_follower_rejects_proposals() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(node(1));

    assert!(cluster.propose(node(2), sample_delta(1)).is_none());
    assert_eq!(cluster.peer(node(2)).leader_id(), Some(node(1)));
}

#[test]
fn test_new_leader_elected_after_crash() {
    // Scenario E4: the leader crashes, a new leader emerges at a higher
    // term and accepts writes.
    let mut cluster = SimCluster::new(3);
    cluster.elect(node(1));
    cluster.propose(node(1), sample_delta(1));

    cluster.crash(node(1));
    cluster.fire_election(node(2));

    assert_eq!(cluster.leader(), Some(node(2)));
    assert!(cluster.peer(node(2)).current_term().get() >= 2);

    // The new leader accepts writes.
    assert!(cluster.propose(node(2), sample_delta(2)).is_some());
    check_log_matching(&cluster, &[2, 3]);
}

#[test]
fn test_committed_entry_survives_leader_change() {
    // Safety property: if a leader commits entry e at index i, no later
    // leader ever holds a different entry at i.
    let mut cluster = SimCluster::new(3);
    cluster.elect(node(1));
    let index = cluster.propose(node(1), sample_delta(42)).unwrap();
    assert!(cluster.peer(node(1)).commit_index() >= index);

    cluster.crash(node(1));
    cluster.fire_election(node(3));
    assert_eq!(cluster.leader(), Some(node(3)));

    let entry = cluster.peer(node(3)).log().get(index).unwrap();
    assert_eq!(entry.delta, sample_delta(42));

    // And it is still there after the new leader commits more.
    cluster.propose(node(3), sample_delta(43));
    let entry = cluster.peer(node(3)).log().get(index).unwrap();
    assert_eq!(entry.delta, sample_delta(42));
}

#[test]
fn test_minority_partition_cannot_commit() {
    // Scenario E5: the leader is isolated; the majority side elects a new
    // leader and keeps committing, the isolated side cannot.
    let mut cluster = SimCluster::new(3);
    cluster.elect(node(1));
    cluster.propose(node(1), sample_delta(1));

    cluster.isolate(node(1));

    // The isolated leader accepts a proposal but can never commit it.
    let before = cluster.peer(node(1)).commit_index();
    cluster.propose(node(1), sample_delta(99));
    assert_eq!(cluster.peer(node(1)).commit_index(), before);

    // The majority side elects node 2 and commits.
    cluster.fire_election(node(2));
    assert!(cluster.peer(node(2)).role() == RaftRole::Leader);
    let committed = cluster.propose(node(2), sample_delta(2)).unwrap();
    assert!(cluster.peer(node(2)).commit_index() >= committed);

    check_log_matching(&cluster, &[2, 3]);
}

#[test]
fn test_healed_partition_adopts_majority_history() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(node(1));
    cluster.isolate(node(1));

    // Uncommitted write on the stale leader.
    cluster.propose(node(1), sample_delta(99));

    // The majority moves on.
    cluster.fire_election(node(2));
    let index = cluster.propose(node(2), sample_delta(2)).unwrap();

    // Heal; a heartbeat brings the stale leader back in line.
    cluster.heal(node(1), node(2));
    cluster.heal(node(1), node(3));
    cluster.fire_heartbeat(node(2));

    assert!(cluster.peer(node(1)).role() == RaftRole::Follower);
    let entry = cluster.peer(node(1)).log().get(index).unwrap();
    assert_eq!(entry.delta, sample_delta(2));
    check_log_matching(&cluster, &[1, 2, 3]);
}

#[test]
fn test_vote_split_resolves() {
    // Two candidates split the first election; a later timeout on one of
    // them resolves it at a higher term.
    let mut cluster = SimCluster::new(3);

    // Both time out before any messages are exchanged: simulate by
    // cutting everything, firing both, then healing.
    cluster.isolate(node(1));
    cluster.isolate(node(2));
    cluster.fire_election(node(1));
    cluster.fire_election(node(2));
    assert_eq!(cluster.leader(), None);

    cluster.heal(node(1), node(2));
    cluster.heal(node(1), node(3));
    cluster.heal(node(2), node(3));

    cluster.fire_election(node(2));
    assert_eq!(cluster.leader(), Some(node(2)));
}

#[test]
fn test_five_peer_cluster_tolerates_two_failures() {
    let mut cluster = SimCluster::new(5);
    cluster.elect(node(1));
    cluster.propose(node(1), sample_delta(1));

    cluster.crash(node(4));
    cluster.crash(node(5));

    // Three of five still form a quorum.
    let index = cluster.propose(node(1), sample_delta(2)).unwrap();
    assert!(cluster.peer(node(1)).commit_index() >= index);
    check_log_matching(&cluster, &[1, 2, 3]);
}
