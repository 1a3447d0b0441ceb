//! Lattice database server binary.
//!
//! Recovers the database from the durability directory, joins the
//! replication group when peers are configured, and serves until killed.
//! Exits non-zero when recovery detects WAL or snapshot corruption.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use lattice_core::{NodeId, WorkerId};
use lattice_server::{Coordinator, ServerConfig};

/// Lattice distributed graph database server.
#[derive(Parser, Debug)]
#[command(name = "lattice-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Peer ID of this server in the replication group.
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Storage worker ID of this server.
    #[arg(long, default_value = "0")]
    worker_id: u64,

    /// Address to listen on for peer RPC.
    #[arg(long, default_value = "127.0.0.1:10000")]
    listen_addr: SocketAddr,

    /// Replication peers as `id@host:port`. Repeat per peer; include this
    /// server. Omit entirely for single-node mode.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Base durability directory (`snapshots/` and `wal/` underneath).
    #[arg(long, default_value = "lattice-data")]
    durability_dir: std::path::PathBuf,

    /// Snapshot files to retain; -1 keeps all.
    #[arg(long, default_value = "3")]
    snapshot_max_retained: i64,

    /// Seconds between periodic snapshots.
    #[arg(long, default_value = "300")]
    snapshot_period_secs: u64,

    /// Lower bound of the randomised election window, in milliseconds.
    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomised election window, in milliseconds.
    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    /// Heartbeat interval, in milliseconds.
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Peer RPC call timeout, in milliseconds.
    #[arg(long, default_value = "1000")]
    rpc_call_timeout_ms: u64,

    /// Count of session worker threads in the transport server.
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Development only: simulated RPC latency, in milliseconds.
    #[arg(long)]
    debug_simulated_latency_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn parse_peer(spec: &str) -> Result<(NodeId, SocketAddr), String> {
    let (id, addr) = spec
        .split_once('@')
        .ok_or_else(|| format!("peer '{spec}' is not id@host:port"))?;
    let id = id
        .parse::<u64>()
        .map_err(|e| format!("bad peer id in '{spec}': {e}"))?;
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("bad peer address in '{spec}': {e}"))?;
    Ok((NodeId::new(id), addr))
}

fn main() {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    let mut config = ServerConfig::single_node(
        NodeId::new(args.node_id),
        WorkerId::new(args.worker_id),
        args.listen_addr,
        &args.durability_dir,
    );
    if !args.peers.is_empty() {
        let mut peers = Vec::new();
        for spec in &args.peers {
            match parse_peer(spec) {
                Ok(peer) => peers.push(peer),
                Err(e) => {
                    error!(error = %e, "Invalid --peer");
                    std::process::exit(2);
                }
            }
        }
        config.peers = peers;
    }
    config.durability.snapshot_max_retained = args.snapshot_max_retained;
    config.durability.snapshot_period = Duration::from_secs(args.snapshot_period_secs);
    config.raft.election_timeout_min_ms = args.election_timeout_min_ms;
    config.raft.election_timeout_max_ms = args.election_timeout_max_ms;
    config.raft.heartbeat_interval_ms = args.heartbeat_interval_ms;
    config.rpc.call_timeout_ms = args.rpc_call_timeout_ms;
    config.rpc.workers = args.workers;
    config.rpc.debug_simulated_latency_ms = args.debug_simulated_latency_ms;

    info!(
        node_id = args.node_id,
        worker_id = args.worker_id,
        listen = %args.listen_addr,
        ha = config.ha_enabled(),
        "Starting lattice-server"
    );

    let _coordinator = match Coordinator::open(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            // Fatal WAL/snapshot corruption detected during recovery, or
            // an invalid configuration.
            error!(error = %e, "Failed to start");
            std::process::exit(1);
        }
    };

    info!("Serving; send SIGTERM to stop");
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
