//! Commit orchestration.
//!
//! The coordinator wires a transaction's deltas to both the WAL and the
//! Raft peer. On commit of a mutating transaction on a leader:
//!
//! 1. the buffered deltas are finalised;
//! 2. each delta is proposed as a Raft entry, in order;
//! 3. once all entries are committed by a majority, the WAL flushes
//!    `TxCommit` (with fsync) and the client sees success.
//!
//! If Raft cannot commit within the timeout (loss of leadership, quorum
//! unreachable) the transaction aborts: `TxAbort` goes to the WAL and the
//! client gets a retryable error. Single-node HA-off mode short-circuits
//! steps 2 and 3.
//!
//! The state mutex guards reads and writes of the node state only; RPC
//! and persist I/O happen outside it. The WAL fsync is the exception: the
//! commit path is the single writer thread, and holding the lock there is
//! what keeps transaction framing contiguous on disk.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use lattice_core::{NameId, NodeId, TxId};
use lattice_durability::{
    make_snapshot, recover, wal_dir, StateDelta, WalConfig, WalWriter,
};
use lattice_raft::{Message, PersistentState, RaftConfig, RaftOutput, RaftPeer};
use lattice_rpc::{PeerRpcReply, PeerRpcRequest, RpcHandler, RpcServer, RAFT_CHANNEL_NAME};
use lattice_storage::{InMemoryGraph, Transaction, TransactionEngine};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::network::{spawn_sender, PeerChannel};

/// Timer thread granularity.
const TIMER_TICK: Duration = Duration::from_millis(10);

/// Filename of the persisted `(current_term, voted_for)` pair.
const RAFT_STATE_FILENAME: &str = "raft-state.bin";

/// Mutable node state, under the single state mutex.
struct NodeState {
    graph: InMemoryGraph,
    engine: TransactionEngine,
    wal: WalWriter,
    /// Present only when HA is enabled.
    raft: Option<RaftPeer>,
    /// Deltas buffered per open transaction, in emission order.
    tx_buffers: BTreeMap<TxId, Vec<StateDelta>>,
    /// When the election timer fires next.
    election_deadline: Instant,
    /// When the heartbeat timer fires next (leaders only).
    heartbeat_deadline: Instant,
    /// Persistent Raft state waiting to be written outside the lock.
    pending_persist: Option<PersistentState>,
    /// Set when a committed entry failed to apply; the peer stops.
    halted: Option<String>,
}

struct Inner {
    config: ServerConfig,
    state: Mutex<NodeState>,
    /// Signalled whenever the commit index advances or leadership changes.
    commit_cv: Condvar,
    channels: HashMap<NodeId, Arc<PeerChannel>>,
    stopping: AtomicBool,
}

/// The database coordinator: one per process.
pub struct Coordinator {
    inner: Arc<Inner>,
    rpc_server: Option<RpcServer>,
    threads: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Recovers state from the durability directory and starts the peer.
    ///
    /// # Errors
    /// Returns a durability error when recovery hits corruption (the
    /// process should exit non-zero) and a config error for an invalid
    /// configuration.
    pub fn open(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let recovered = recover(&config.durability.durability_dir, config.worker_id)?;
        info!(
            vertices = recovered.graph.vertex_count(),
            edges = recovered.graph.edge_count(),
            replayed = recovered.replayed_transactions,
            "Database recovered"
        );

        let wal = WalWriter::open(WalConfig::new(wal_dir(&config.durability.durability_dir)))?;

        let raft = if config.ha_enabled() {
            let raft_config = RaftConfig::new(config.node_id, config.cluster())
                .with_election_timeout_ms(
                    config.raft.election_timeout_min_ms,
                    config.raft.election_timeout_max_ms,
                )
                .with_heartbeat_interval_ms(config.raft.heartbeat_interval_ms);
            let mut peer = RaftPeer::new(raft_config);
            if let Some(state) = load_raft_state(&raft_state_path(&config)) {
                info!(term = state.current_term.get(), "Restored raft state");
                peer.restore(&state);
            }
            Some(peer)
        } else {
            None
        };

        let now = Instant::now();
        let state = NodeState {
            graph: recovered.graph,
            engine: recovered.engine,
            wal,
            raft,
            tx_buffers: BTreeMap::new(),
            election_deadline: now
                + Duration::from_millis(config.raft.election_timeout_max_ms),
            heartbeat_deadline: now,
            pending_persist: None,
            halted: None,
        };

        let call_timeout = Duration::from_millis(config.rpc.call_timeout_ms);
        let debug_latency = config
            .rpc
            .debug_simulated_latency_ms
            .map(Duration::from_millis);
        let mut channels = HashMap::new();
        if config.ha_enabled() {
            for &(peer_id, endpoint) in &config.peers {
                if peer_id == config.node_id {
                    continue;
                }
                channels.insert(
                    peer_id,
                    Arc::new(PeerChannel::new(
                        peer_id,
                        endpoint,
                        call_timeout,
                        debug_latency,
                    )),
                );
            }
        }

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(state),
            commit_cv: Condvar::new(),
            channels,
            stopping: AtomicBool::new(false),
        });

        let mut threads = Vec::new();
        let rpc_server = if inner.config.ha_enabled() {
            let server = RpcServer::start(
                inner.config.listen_addr,
                RAFT_CHANNEL_NAME,
                inner.config.rpc.workers,
                Arc::clone(&inner) as Arc<dyn RpcHandler>,
            )?;

            for channel in inner.channels.values() {
                let responder = Arc::clone(&inner);
                threads.push(spawn_sender(Arc::clone(channel), move |message| {
                    responder.handle_peer_response(message);
                }));
            }

            let timer_inner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("raft-timers".to_owned())
                    .spawn(move || timer_loop(&timer_inner))
                    .expect("failed to spawn timer thread"),
            );

            Some(server)
        } else {
            None
        };

        let snapshot_inner = Arc::clone(&inner);
        threads.push(
            std::thread::Builder::new()
                .name("snapshotter".to_owned())
                .spawn(move || snapshot_loop(&snapshot_inner))
                .expect("failed to spawn snapshot thread"),
        );

        Ok(Self {
            inner,
            rpc_server,
            threads,
        })
    }

    /// Begins a transaction.
    pub fn begin(&self) -> Transaction {
        self.inner.lock_state().engine.begin()
    }

    /// Buffers a mutation delta for its owning transaction.
    pub fn buffer(&self, delta: StateDelta) {
        assert!(
            !delta.kind().is_transaction_control(),
            "transaction markers are written by commit/abort"
        );
        let mut state = self.inner.lock_state();
        state.tx_buffers.entry(delta.tx()).or_default().push(delta);
    }

    /// Commits a transaction: replicates its deltas (when HA is on),
    /// applies them, and makes them durable.
    ///
    /// # Errors
    /// `NotLeader` when this peer cannot accept writes, `QuorumLost` when
    /// replication timed out (the transaction was aborted), `ApplyFatal`
    /// when a delta was refused.
    pub fn commit(&self, tx: &Transaction) -> ServerResult<()> {
        if self.inner.config.ha_enabled() {
            self.commit_replicated(tx)
        } else {
            self.commit_local(tx)
        }
    }

    /// Aborts a transaction: the buffer is dropped, `TxAbort` is logged.
    ///
    /// # Errors
    /// Returns a durability error if the WAL write fails.
    pub fn abort(&self, tx: &Transaction) -> ServerResult<()> {
        let mut state = self.inner.lock_state();
        state.tx_buffers.remove(&tx.id);
        state.wal.abort(tx.id)?;
        state.engine.finish(tx.id);
        Ok(())
    }

    /// Runs a closure over the graph under the state lock.
    pub fn with_graph<R>(&self, f: impl FnOnce(&InMemoryGraph) -> R) -> R {
        f(&self.inner.lock_state().graph)
    }

    /// Interns a label name.
    pub fn label(&self, name: &str) -> NameId {
        self.inner.lock_state().graph.label(name)
    }

    /// Interns a property name.
    pub fn property(&self, name: &str) -> NameId {
        self.inner.lock_state().graph.property(name)
    }

    /// Interns an edge type name.
    pub fn edge_type(&self, name: &str) -> NameId {
        self.inner.lock_state().graph.edge_type(name)
    }

    /// Generates a fresh vertex id.
    pub fn generate_vertex_id(&self) -> lattice_core::Gid {
        self.inner.lock_state().graph.generate_vertex_id()
    }

    /// Generates a fresh edge id.
    pub fn generate_edge_id(&self) -> lattice_core::Gid {
        self.inner.lock_state().graph.generate_edge_id()
    }

    /// Returns true if this peer currently leads the group. Single-node
    /// mode always leads.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        let state = self.inner.lock_state();
        state.raft.as_ref().map_or(true, RaftPeer::is_leader)
    }

    /// Returns the known leader, the `NotLeader` hint.
    #[must_use]
    pub fn leader_hint(&self) -> Option<NodeId> {
        let state = self.inner.lock_state();
        state
            .raft
            .as_ref()
            .map_or(Some(self.inner.config.node_id), RaftPeer::leader_id)
    }

    /// Takes a snapshot now and prunes superseded files.
    ///
    /// # Errors
    /// Returns a durability error if the dump fails.
    pub fn snapshot(&self) -> ServerResult<()> {
        self.inner.take_snapshot()?;
        Ok(())
    }

    /// Single-node commit: apply locally, then WAL.
    fn commit_local(&self, tx: &Transaction) -> ServerResult<()> {
        let mut state = self.inner.lock_state();
        let deltas = state.tx_buffers.remove(&tx.id).unwrap_or_default();

        for delta in &deltas {
            if let Err(e) = delta.apply(&mut state.graph) {
                state.wal.abort(tx.id)?;
                state.engine.finish(tx.id);
                return Err(ServerError::ApplyFatal {
                    reason: e.to_string(),
                });
            }
        }

        for delta in deltas {
            state.wal.buffer(delta);
        }
        state.wal.commit(tx.id)?;
        state.engine.finish(tx.id);
        Ok(())
    }

    /// Replicated commit: propose to Raft, await the majority, then WAL.
    fn commit_replicated(&self, tx: &Transaction) -> ServerResult<()> {
        let deadline = Instant::now() + self.inner.config.raft.commit_timeout;

        // Propose every delta, in emission order.
        let target = {
            let mut state = self.inner.lock_state();
            if let Some(reason) = &state.halted {
                return Err(ServerError::ApplyFatal {
                    reason: reason.clone(),
                });
            }

            let deltas = state.tx_buffers.remove(&tx.id).unwrap_or_default();
            let raft = state.raft.as_mut().expect("raft present in ha mode");
            if !raft.is_leader() {
                let hint = raft.leader_id();
                state.engine.finish(tx.id);
                return Err(ServerError::NotLeader { leader_hint: hint });
            }

            let mut target = None;
            let mut all_outputs = Vec::new();
            let mut proposed = Vec::new();
            for delta in deltas {
                // The role cannot change while the state lock is held, so
                // every propose after the leadership check succeeds.
                let (index, outputs) = state
                    .raft
                    .as_mut()
                    .expect("raft present in ha mode")
                    .propose(delta.clone())
                    .expect("leadership cannot be lost under the state lock");
                target = Some(index);
                all_outputs.extend(outputs);
                proposed.push(delta);
            }
            self.inner.process_outputs(&mut state, all_outputs, None);
            state.tx_buffers.insert(tx.id, proposed);
            target
        };
        self.inner.flush_pending_persist();

        let Some(target) = target else {
            // Empty transaction: nothing to replicate, commit the marker.
            let mut state = self.inner.lock_state();
            state.tx_buffers.remove(&tx.id);
            state.wal.commit(tx.id)?;
            state.engine.finish(tx.id);
            return Ok(());
        };

        // Await the majority. Once a quorum has accepted every entry the
        // commit must complete; only a timeout *before* that point aborts.
        let mut state = self.inner.lock_state();
        loop {
            if let Some(reason) = &state.halted {
                return Err(ServerError::ApplyFatal {
                    reason: reason.clone(),
                });
            }
            let raft = state.raft.as_ref().expect("raft present in ha mode");
            if raft.commit_index() >= target {
                break;
            }
            let still_leader = raft.is_leader();
            let now = Instant::now();
            if !still_leader || now >= deadline {
                warn!(
                    tx = tx.id.get(),
                    still_leader, "Commit did not reach a majority in time"
                );
                state.tx_buffers.remove(&tx.id);
                state.wal.abort(tx.id)?;
                state.engine.finish(tx.id);
                return Err(ServerError::QuorumLost);
            }

            let (next, _timeout) = self
                .inner
                .commit_cv
                .wait_timeout(state, deadline - now)
                .expect("state mutex poisoned");
            state = next;
        }

        // Durable only now: TxBegin, the deltas, TxCommit, fsync.
        let deltas = state.tx_buffers.remove(&tx.id).unwrap_or_default();
        for delta in deltas {
            state.wal.buffer(delta);
        }
        state.wal.commit(tx.id)?;
        state.engine.finish(tx.id);
        debug!(tx = tx.id.get(), index = target.get(), "Replicated commit complete");
        Ok(())
    }

    /// Stops all threads and seals the WAL.
    pub fn shutdown(&mut self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        for channel in self.inner.channels.values() {
            channel.stop();
        }
        if let Some(server) = &mut self.rpc_server {
            server.shutdown();
        }
        self.inner.commit_cv.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        let mut state = self.inner.lock_state();
        if let Err(e) = state.wal.close() {
            error!(error = %e, "Failed to seal WAL on shutdown");
        }
        info!("Coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().expect("state mutex poisoned")
    }

    /// Applies Raft outputs to the node state. When `reply_to` is given
    /// (server side of an RPC), the response message addressed to that
    /// peer is extracted and returned instead of being queued.
    fn process_outputs(
        &self,
        state: &mut NodeState,
        outputs: Vec<RaftOutput>,
        reply_to: Option<NodeId>,
    ) -> Option<Message> {
        let mut reply = None;
        let mut committed = false;

        for output in outputs {
            match output {
                RaftOutput::SendMessage(message) => {
                    let is_response = matches!(
                        message,
                        Message::RequestVoteResponse(_) | Message::AppendEntriesResponse(_)
                    );
                    if is_response {
                        if reply_to == Some(message.to()) && reply.is_none() {
                            reply = Some(message);
                        }
                        // A response with no in-band requester to carry it
                        // is dropped; the peer will retransmit.
                        continue;
                    }
                    if let Some(channel) = self.channels.get(&message.to()) {
                        channel.enqueue(message);
                    }
                }
                RaftOutput::ResetElectionTimer(timeout) => {
                    state.election_deadline = Instant::now() + timeout;
                }
                RaftOutput::ResetHeartbeatTimer => {
                    state.heartbeat_deadline = Instant::now()
                        + Duration::from_millis(self.config.raft.heartbeat_interval_ms);
                }
                RaftOutput::PersistState(persistent) => {
                    state.pending_persist = Some(persistent);
                }
                RaftOutput::CommitEntry { index, delta } => {
                    if state.halted.is_some() {
                        continue;
                    }
                    if let Err(e) = delta.apply(&mut state.graph) {
                        // Corruption: halt applying, surface everywhere.
                        error!(index = index.get(), error = %e, "Fatal apply failure");
                        state.halted = Some(e.to_string());
                        continue;
                    }
                    committed = true;
                }
                RaftOutput::BecameLeader => {
                    info!(node = self.config.node_id.get(), "Became leader");
                    committed = true; // Wake commit waiters to re-check.
                }
                RaftOutput::SteppedDown => {
                    info!(node = self.config.node_id.get(), "Stepped down");
                    committed = true;
                }
            }
        }

        if committed {
            self.commit_cv.notify_all();
        }
        reply
    }

    /// Handles a Raft response delivered by a sender thread.
    fn handle_peer_response(&self, message: Message) {
        {
            let mut state = self.lock_state();
            if state.halted.is_some() {
                return;
            }
            let Some(raft) = state.raft.as_mut() else {
                return;
            };
            let outputs = raft.handle_message(message);
            self.process_outputs(&mut state, outputs, None);
        }
        self.flush_pending_persist();
    }

    /// Writes any pending persistent state to disk, outside the lock.
    ///
    /// Raft requires `(current_term, voted_for)` on stable storage before
    /// the RPC that changed it is answered; callers flush before replying.
    fn flush_pending_persist(&self) {
        let pending = { self.lock_state().pending_persist.take() };
        let Some(persistent) = pending else { return };

        let path = raft_state_path(&self.config);
        let mut buf = BytesMut::with_capacity(17);
        persistent.encode(&mut buf);

        let result = std::fs::File::create(&path)
            .and_then(|mut file| {
                file.write_all(&buf)?;
                file.sync_data()
            });
        if let Err(e) = result {
            error!(path = %path.display(), error = %e, "Failed to persist raft state");
        }
    }

    /// Produces a snapshot from a consistent read copy of the graph.
    fn take_snapshot(&self) -> ServerResult<PathBuf> {
        let (graph, tx) = {
            let mut state = self.lock_state();
            let tx = state.engine.begin();
            // Rotation at snapshot begin: sealed segments now hold only
            // commits the snapshot covers, making retention safe.
            state.wal.rotate()?;
            (state.graph.clone(), tx)
        };

        let result = make_snapshot(
            &graph,
            &tx,
            &self.config.durability.durability_dir,
            self.config.durability.snapshot_max_retained,
        );

        let mut state = self.lock_state();
        state.engine.finish(tx.id);
        if let Some(raft) = state.raft.as_mut() {
            // Install-snapshot boundary: entries covered by the snapshot
            // are no longer needed in the log.
            let applied = raft.last_applied();
            raft.compact_log_to(applied);
        }
        drop(state);

        Ok(result?)
    }
}

impl RpcHandler for Inner {
    fn handle(&self, request: PeerRpcRequest) -> Option<PeerRpcReply> {
        let message = match (request.request_vote, request.append_entries) {
            (Some(req), _) => Message::RequestVote(req),
            (_, Some(req)) => Message::AppendEntries(req),
            _ => return None,
        };
        let requester = message.from();

        let reply = {
            let mut state = self.lock_state();
            if state.halted.is_some() {
                return None;
            }
            let raft = state.raft.as_mut()?;
            let outputs = raft.handle_message(message);
            self.process_outputs(&mut state, outputs, Some(requester))
        };

        // Persist before answering: a granted vote or adopted term must
        // survive a crash that happens right after the reply.
        self.flush_pending_persist();

        match reply? {
            Message::RequestVoteResponse(resp) => Some(PeerRpcReply::request_vote(resp)),
            Message::AppendEntriesResponse(resp) => Some(PeerRpcReply::append_entries(resp)),
            _ => None,
        }
    }
}

/// Drives election and heartbeat timers.
fn timer_loop(inner: &Arc<Inner>) {
    while !inner.stopping.load(Ordering::SeqCst) {
        std::thread::sleep(TIMER_TICK);

        {
            let mut state = inner.lock_state();
            if state.halted.is_some() {
                continue;
            }
            let election_deadline = state.election_deadline;
            let heartbeat_deadline = state.heartbeat_deadline;
            let Some(raft) = state.raft.as_mut() else {
                continue;
            };

            let now = Instant::now();
            if !raft.is_leader() && now >= election_deadline {
                let outputs = raft.handle_election_timeout();
                inner.process_outputs(&mut state, outputs, None);
            } else if raft.is_leader() && now >= heartbeat_deadline {
                let outputs = raft.handle_heartbeat_timeout();
                inner.process_outputs(&mut state, outputs, None);
            }
        }
        inner.flush_pending_persist();
    }
}

/// Checkpoints on the configured cadence.
fn snapshot_loop(inner: &Arc<Inner>) {
    let period = inner.config.durability.snapshot_period;
    let mut last = Instant::now();
    while !inner.stopping.load(Ordering::SeqCst) {
        std::thread::sleep(TIMER_TICK.max(Duration::from_millis(50)));
        if last.elapsed() < period {
            continue;
        }
        last = Instant::now();
        match inner.take_snapshot() {
            Ok(path) => info!(path = %path.display(), "Periodic snapshot complete"),
            Err(e) => warn!(error = %e, "Periodic snapshot failed"),
        }
    }
}

fn raft_state_path(config: &ServerConfig) -> PathBuf {
    config
        .durability
        .durability_dir
        .join(RAFT_STATE_FILENAME)
}

fn load_raft_state(path: &std::path::Path) -> Option<PersistentState> {
    let bytes = std::fs::read(path).ok()?;
    PersistentState::decode(&mut &bytes[..])
}
