//! The Raft peer network.
//!
//! One RPC client and one sender thread per peer, keyed by id in a
//! separately-owned map; nothing here holds a reference back into the
//! coordinator, so there are no ownership cycles. The sender thread pops
//! outbound requests, performs the blocking call, and hands any reply to
//! the callback. Transport failures are swallowed: Raft sees them as
//! silent no-responses and lets its timers resolve the situation.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use lattice_core::NodeId;
use lattice_raft::Message;
use lattice_rpc::{PeerRpcReply, PeerRpcRequest, RpcClient};
use tracing::{debug, trace};

/// Maximum queued outbound messages per peer; the oldest are dropped
/// first. Raft retransmits, so dropping is safe.
const PEER_QUEUE_DEPTH_MAX: usize = 1024;

/// Wraps an outbound Raft request in the wire envelope.
///
/// Only requests travel this way; responses are returned in-band as the
/// RPC reply. Returns `None` for response messages.
#[must_use]
pub fn request_envelope(message: &Message) -> Option<PeerRpcRequest> {
    match message {
        Message::RequestVote(req) => Some(PeerRpcRequest::request_vote(*req)),
        Message::AppendEntries(req) => Some(PeerRpcRequest::append_entries(req.clone())),
        Message::RequestVoteResponse(_) | Message::AppendEntriesResponse(_) => None,
    }
}

/// Unwraps an RPC reply into the Raft response message it carries.
#[must_use]
pub fn response_message(reply: PeerRpcReply) -> Option<Message> {
    reply
        .request_vote
        .map(Message::RequestVoteResponse)
        .or_else(|| reply.append_entries.map(Message::AppendEntriesResponse))
}

/// Outbound queue and connection for one peer.
pub struct PeerChannel {
    /// The peer this channel reaches.
    pub node_id: NodeId,
    client: RpcClient,
    queue: Mutex<VecDeque<Message>>,
    available: Condvar,
    stopping: AtomicBool,
}

impl PeerChannel {
    /// Creates a channel for one peer endpoint.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        endpoint: SocketAddr,
        call_timeout: Duration,
        debug_latency: Option<Duration>,
    ) -> Self {
        let mut client = RpcClient::new(endpoint, call_timeout);
        if let Some(latency) = debug_latency {
            client = client.with_debug_latency(latency);
        }
        Self {
            node_id,
            client,
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Queues a request for delivery. Overflow drops the oldest entry;
    /// Raft retransmission covers the loss.
    pub fn enqueue(&self, message: Message) {
        let mut queue = self.queue.lock().expect("peer queue mutex poisoned");
        if queue.len() >= PEER_QUEUE_DEPTH_MAX {
            queue.pop_front();
        }
        queue.push_back(message);
        drop(queue);
        self.available.notify_one();
    }

    /// Stops the sender thread and aborts any in-flight call.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.client.abort();
        self.available.notify_all();
    }

    /// Blocks until a message is available or the channel stops.
    fn next_message(&self) -> Option<Message> {
        let mut queue = self.queue.lock().expect("peer queue mutex poisoned");
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            queue = self
                .available
                .wait(queue)
                .expect("peer queue mutex poisoned");
        }
    }
}

/// Spawns the sender thread for a peer channel.
///
/// Each delivered reply is handed to `on_response`; failed calls produce
/// nothing at all.
pub fn spawn_sender<F>(channel: Arc<PeerChannel>, on_response: F) -> JoinHandle<()>
where
    F: Fn(Message) + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("raft-peer-{}", channel.node_id.get()))
        .spawn(move || {
            while let Some(message) = channel.next_message() {
                let Some(request) = request_envelope(&message) else {
                    debug_assert!(false, "only requests are queued for delivery");
                    continue;
                };

                match channel.client.call(&request) {
                    Ok(reply) => {
                        if let Some(response) = response_message(reply) {
                            trace!(peer = channel.node_id.get(), "Delivered rpc, got response");
                            on_response(response);
                        }
                    }
                    Err(e) => {
                        // A failed call is a no-response; the Raft timers
                        // will deal with it.
                        debug!(peer = channel.node_id.get(), error = %e, "Peer call failed");
                    }
                }
            }
        })
        .expect("failed to spawn peer sender thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::{LogIndex, TermId};
    use lattice_raft::{RequestVoteRequest, RequestVoteResponse};

    fn vote_message() -> Message {
        Message::RequestVote(RequestVoteRequest::new(
            TermId::new(1),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(0),
            TermId::new(0),
        ))
    }

    #[test]
    fn test_request_envelope_only_wraps_requests() {
        assert!(request_envelope(&vote_message()).is_some());

        let response = Message::RequestVoteResponse(RequestVoteResponse::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            true,
        ));
        assert!(request_envelope(&response).is_none());
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let channel = PeerChannel::new(
            NodeId::new(2),
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(10),
            None,
        );

        for _ in 0..=PEER_QUEUE_DEPTH_MAX {
            channel.enqueue(vote_message());
        }

        let queue = channel.queue.lock().unwrap();
        assert_eq!(queue.len(), PEER_QUEUE_DEPTH_MAX);
    }

    #[test]
    fn test_stop_wakes_sender() {
        let channel = Arc::new(PeerChannel::new(
            NodeId::new(2),
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(10),
            None,
        ));

        let handle = spawn_sender(Arc::clone(&channel), |_| {});
        channel.stop();
        handle.join().unwrap();
    }
}
