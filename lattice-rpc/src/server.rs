//! The peer RPC server.
//!
//! A listener thread accepts connections and hands them to a fixed pool
//! of worker threads, round-robin. Each worker serves its connection's
//! requests sequentially until the peer disconnects (clients hold one
//! connection and one outstanding call, so per-connection sequencing is
//! the protocol's own invariant).
//!
//! Dispatch is by request tag. An unknown tag is logged and gets no reply
//! at all - the caller sees a timeout. A half-open connection (the peer
//! aborted mid-request) discards the partial request silently.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::client::read_frame;
use crate::error::{RpcError, RpcResult};
use crate::limits::CHANNEL_NAME_LENGTH_MAX;
use crate::wire::{decode_request, encode_reply, PeerRpcReply, PeerRpcRequest};

/// Server-side dispatch for peer requests.
///
/// The implementation is owned by the orchestrator; the transport only
/// borrows it (behind `Arc`) for as long as the server runs, so a stopped
/// server never outlives the state it dispatches into.
pub trait RpcHandler: Send + Sync {
    /// Handles one request. Returning `None` sends no reply, which the
    /// caller observes as a timeout.
    fn handle(&self, request: PeerRpcRequest) -> Option<PeerRpcReply>;
}

impl<F> RpcHandler for F
where
    F: Fn(PeerRpcRequest) -> Option<PeerRpcReply> + Send + Sync,
{
    fn handle(&self, request: PeerRpcRequest) -> Option<PeerRpcReply> {
        self(request)
    }
}

/// A running RPC server.
pub struct RpcServer {
    local_addr: SocketAddr,
    channel: String,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Binds and starts serving on `workers` session worker threads.
    ///
    /// # Errors
    /// Returns a transport error if the address cannot be bound.
    ///
    /// # Panics
    /// Panics if `workers` is zero.
    pub fn start(
        addr: SocketAddr,
        channel: impl Into<String>,
        workers: usize,
        handler: Arc<dyn RpcHandler>,
    ) -> RpcResult<Self> {
        assert!(workers > 0, "at least one worker thread is required");
        let channel = channel.into();
        assert!(
            channel.len() <= CHANNEL_NAME_LENGTH_MAX,
            "channel name too long"
        );

        let listener = TcpListener::bind(addr).map_err(RpcError::transport)?;
        let local_addr = listener.local_addr().map_err(RpcError::transport)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        // One queue per worker; the accept loop deals connections out
        // round-robin.
        let mut senders = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (sender, receiver) = mpsc::channel::<TcpStream>();
            senders.push(sender);

            let handler = Arc::clone(&handler);
            let channel = channel.clone();
            std::thread::Builder::new()
                .name(format!("rpc-worker-{worker_id}"))
                .spawn(move || worker_loop(&receiver, &*handler, &channel))
                .map_err(RpcError::transport)?;
        }

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = std::thread::Builder::new()
            .name("rpc-accept".to_owned())
            .spawn(move || accept_loop(&listener, &senders, &accept_shutdown))
            .map_err(RpcError::transport)?;

        info!(%local_addr, workers, "RPC server listening");
        Ok(Self {
            local_addr,
            channel,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    /// Returns the bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the channel name this server speaks.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stops accepting connections. Workers drain and exit as their
    /// connections close.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Poke the accept loop out of its blocking accept.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        info!(addr = %self.local_addr, "RPC server stopped");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: &TcpListener,
    senders: &[mpsc::Sender<TcpStream>],
    shutdown: &AtomicBool,
) {
    let mut next_worker = 0usize;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                debug!(%peer, worker = next_worker % senders.len(), "Accepted connection");
                if senders[next_worker % senders.len()].send(stream).is_err() {
                    return;
                }
                next_worker = next_worker.wrapping_add(1);
            }
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                warn!(error = %e, "Accept failed");
            }
        }
    }
}

fn worker_loop(receiver: &mpsc::Receiver<TcpStream>, handler: &dyn RpcHandler, channel: &str) {
    while let Ok(stream) = receiver.recv() {
        if let Err(e) = serve_connection(handler, &stream, channel) {
            debug!(error = %e, "Connection closed");
        }
    }
}

/// Serves one connection until the peer disconnects.
fn serve_connection(
    handler: &dyn RpcHandler,
    mut stream: &TcpStream,
    channel: &str,
) -> std::io::Result<()> {
    // Preamble: the channel name the client wants to speak.
    let mut len = [0u8; 1];
    stream.read_exact(&mut len)?;
    let mut name = vec![0u8; len[0] as usize];
    stream.read_exact(&mut name)?;
    if name != channel.as_bytes() {
        warn!(
            requested = %String::from_utf8_lossy(&name),
            expected = channel,
            "Rejecting connection for unknown channel"
        );
        return Ok(());
    }

    loop {
        let frame = match read_frame(stream) {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Peer disconnected; a half-open mid-request is discarded.
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match decode_request(&frame) {
            Ok((request_id, request)) => {
                if let Some(reply) = handler.handle(request) {
                    let reply_frame = encode_reply(&reply, request_id)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                    stream.write_all(&reply_frame)?;
                }
            }
            Err(crate::wire::WireError::UnknownTag { tag }) => {
                // No reply at all: the caller resolves this as a timeout.
                error!(tag, "Unknown RPC tag");
            }
            Err(e) => {
                warn!(error = %e, "Malformed request, dropping connection");
                return Ok(());
            }
        }
    }
}
