//! Deterministic cluster harness.
//!
//! Shuttles messages between pure [`RaftPeer`] state machines with no
//! I/O, no timers and no threads. Partitions drop messages on the floor,
//! exactly as a real network failure would; Raft sees silent
//! no-responses either way. Committed deltas are recorded per peer so
//! tests can check the safety properties directly.

use std::collections::{BTreeMap, HashSet, VecDeque};

use lattice_core::{LogIndex, NodeId, TxId};
use lattice_durability::StateDelta;
use lattice_raft::{Message, RaftConfig, RaftOutput, RaftPeer, RaftRole};

/// A cluster of pure Raft peers with a simulated network.
pub struct SimCluster {
    peers: BTreeMap<NodeId, RaftPeer>,
    /// Undelivered messages.
    in_flight: VecDeque<Message>,
    /// Links that drop messages, in either direction.
    cut_links: HashSet<(NodeId, NodeId)>,
    /// Peers that are down entirely.
    crashed: HashSet<NodeId>,
    /// Deltas each peer has applied, in commit order.
    applied: BTreeMap<NodeId, Vec<(LogIndex, StateDelta)>>,
}

impl SimCluster {
    /// Creates a cluster of `size` peers with ids 1..=size.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    #[must_use]
    pub fn new(size: u64) -> Self {
        assert!(size > 0, "cluster cannot be empty");
        let ids: Vec<NodeId> = (1..=size).map(NodeId::new).collect();

        let mut peers = BTreeMap::new();
        let mut applied = BTreeMap::new();
        for &id in &ids {
            let config = RaftConfig::new(id, ids.clone()).with_seed(id.get());
            peers.insert(id, RaftPeer::new(config));
            applied.insert(id, Vec::new());
        }

        Self {
            peers,
            in_flight: VecDeque::new(),
            cut_links: HashSet::new(),
            crashed: HashSet::new(),
            applied,
        }
    }

    /// Returns the peer with the given id.
    ///
    /// # Panics
    /// Panics for an unknown id.
    #[must_use]
    pub fn peer(&self, id: NodeId) -> &RaftPeer {
        &self.peers[&id]
    }

    /// Returns the current leader, if exactly one peer leads.
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        let leaders: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(id, peer)| !self.crashed.contains(id) && peer.is_leader())
            .map(|(&id, _)| id)
            .collect();
        match leaders.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    /// Returns the deltas a peer has applied so far.
    #[must_use]
    pub fn applied(&self, id: NodeId) -> &[(LogIndex, StateDelta)] {
        &self.applied[&id]
    }

    /// Fires the election timer on one peer and settles the network.
    pub fn fire_election(&mut self, id: NodeId) {
        if self.crashed.contains(&id) {
            return;
        }
        let outputs = self
            .peers
            .get_mut(&id)
            .expect("unknown peer")
            .handle_election_timeout();
        self.collect(id, outputs);
        self.settle();
    }

    /// Fires the heartbeat timer on one peer and settles the network.
    pub fn fire_heartbeat(&mut self, id: NodeId) {
        if self.crashed.contains(&id) {
            return;
        }
        let outputs = self
            .peers
            .get_mut(&id)
            .expect("unknown peer")
            .handle_heartbeat_timeout();
        self.collect(id, outputs);
        self.settle();
    }

    /// Proposes a delta on a peer. Returns the assigned index when the
    /// peer is leader; the network is settled afterwards either way.
    pub fn propose(&mut self, id: NodeId, delta: StateDelta) -> Option<LogIndex> {
        let result = self
            .peers
            .get_mut(&id)
            .expect("unknown peer")
            .propose(delta);
        let index = result.map(|(index, outputs)| {
            self.collect(id, outputs);
            index
        });
        self.settle();
        index
    }

    /// Cuts the link between two peers, both directions.
    pub fn cut(&mut self, a: NodeId, b: NodeId) {
        self.cut_links.insert((a, b));
        self.cut_links.insert((b, a));
    }

    /// Heals the link between two peers.
    pub fn heal(&mut self, a: NodeId, b: NodeId) {
        self.cut_links.remove(&(a, b));
        self.cut_links.remove(&(b, a));
    }

    /// Isolates one peer from everybody else.
    pub fn isolate(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self.peers.keys().copied().filter(|&o| o != id).collect();
        for other in others {
            self.cut(id, other);
        }
    }

    /// Crashes a peer: it receives nothing and produces nothing.
    pub fn crash(&mut self, id: NodeId) {
        self.crashed.insert(id);
    }

    /// Delivers every in-flight message until the network is quiet.
    pub fn settle(&mut self) {
        // Bounded: each delivery can fan out, but terms and indexes are
        // finite in any one scenario. The cap catches livelock bugs.
        let mut budget = 100_000u32;
        while let Some(message) = self.in_flight.pop_front() {
            budget -= 1;
            assert!(budget > 0, "network did not settle");

            let from = message.from();
            let to = message.to();
            if self.crashed.contains(&to) || self.cut_links.contains(&(from, to)) {
                continue;
            }

            let outputs = self
                .peers
                .get_mut(&to)
                .expect("unknown peer")
                .handle_message(message);
            self.collect(to, outputs);
        }
    }

    /// Records a peer's outputs, queueing its messages for delivery.
    fn collect(&mut self, id: NodeId, outputs: Vec<RaftOutput>) {
        for output in outputs {
            match output {
                RaftOutput::SendMessage(message) => {
                    if !self.crashed.contains(&id) {
                        self.in_flight.push_back(message);
                    }
                }
                RaftOutput::CommitEntry { index, delta } => {
                    self.applied
                        .get_mut(&id)
                        .expect("unknown peer")
                        .push((index, delta));
                }
                RaftOutput::ResetElectionTimer(_)
                | RaftOutput::ResetHeartbeatTimer
                | RaftOutput::PersistState(_)
                | RaftOutput::BecameLeader
                | RaftOutput::SteppedDown => {}
            }
        }
    }

    /// Elects the given peer by firing its election timer; panics if it
    /// does not win.
    pub fn elect(&mut self, id: NodeId) {
        self.fire_election(id);
        assert!(
            self.peers[&id].role() == RaftRole::Leader,
            "{id} failed to win its election"
        );
    }
}

/// Convenience constructor for a vertex-creation delta.
#[must_use]
pub fn sample_delta(tx: u64) -> StateDelta {
    StateDelta::CreateVertex {
        tx: TxId::new(tx),
        vertex: lattice_core::Gid::new(tx),
    }
}
