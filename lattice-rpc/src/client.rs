//! The peer RPC client.
//!
//! The client is thread safe but admits only one outstanding call:
//! concurrent callers serialise at the call mutex. A pending call can be
//! aborted from another thread; the abort closes the socket, the blocked
//! caller wakes with [`RpcError::Aborted`] and the next call reconnects.
//!
//! Internally the call slot is a small state machine:
//!
//! ```text
//! Idle --call--> InFlight(request_id) --reply/failure--> Idle
//!                    |
//!                  abort (socket shut down)
//!                    v
//!                 Aborted --caller observes--> Idle
//! ```

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult};
use crate::limits::FRAME_SIZE_BYTES_MAX;
use crate::wire::{decode_reply, encode_request, PeerRpcReply, PeerRpcRequest, RAFT_CHANNEL_NAME};

/// State of the single call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    /// No call in progress.
    Idle,
    /// A call with this request id is on the wire.
    InFlight(u64),
    /// The in-flight call was aborted from another thread.
    Aborted,
}

/// Shared connection state, guarded separately from the caller mutex so
/// `abort` can reach it while a call is blocked on the socket.
#[derive(Debug)]
struct CallSlot {
    socket: Option<TcpStream>,
    state: CallState,
    next_request_id: u64,
}

/// A typed request/response client for one peer.
pub struct RpcClient {
    endpoint: SocketAddr,
    channel: String,
    call_timeout: Duration,
    connect_timeout: Duration,
    /// Development-only simulated latency; never set by production paths.
    debug_latency: Option<Duration>,
    /// Serialises callers: at most one outstanding call per client.
    call_lock: Mutex<()>,
    slot: Mutex<CallSlot>,
}

impl RpcClient {
    /// Creates a client for the given peer endpoint.
    #[must_use]
    pub fn new(endpoint: SocketAddr, call_timeout: Duration) -> Self {
        Self {
            endpoint,
            channel: RAFT_CHANNEL_NAME.to_owned(),
            call_timeout,
            connect_timeout: Duration::from_secs(5),
            debug_latency: None,
            call_lock: Mutex::new(()),
            slot: Mutex::new(CallSlot {
                socket: None,
                state: CallState::Idle,
                next_request_id: 1,
            }),
        }
    }

    /// Overrides the channel name (tests only; peers use the Raft channel).
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables simulated call latency. Development builds only; leave
    /// unset in production configurations.
    #[must_use]
    pub const fn with_debug_latency(mut self, latency: Duration) -> Self {
        self.debug_latency = Some(latency);
        self
    }

    /// Issues one call and blocks until the reply, a failure, the timeout
    /// or an abort. The timeout clock starts when bytes are first written.
    ///
    /// # Errors
    /// `Timeout` when no reply arrives in time, `Aborted` when another
    /// thread aborted the call, `Transport` on any connection or wire
    /// failure. All are "no reply" to the Raft layer.
    pub fn call(&self, request: &PeerRpcRequest) -> RpcResult<PeerRpcReply> {
        let _serialised = self.call_lock.lock().expect("client call mutex poisoned");

        if let Some(latency) = self.debug_latency {
            std::thread::sleep(latency);
        }

        let (stream, request_id) = self.checkout_connection()?;
        let result = self.exchange(&stream, request, request_id);
        match self.checkin_connection(result.is_err()) {
            Some(abort_error) => Err(abort_error),
            None => result,
        }
    }

    /// Aborts the pending call, if any, from another thread.
    ///
    /// Closes the socket so the blocked caller wakes immediately; the
    /// caller observes [`RpcError::Aborted`] and the connection is
    /// re-established on the next call.
    pub fn abort(&self) {
        let mut slot = self.slot.lock().expect("client slot mutex poisoned");
        if let CallState::InFlight(request_id) = slot.state {
            debug!(request_id, "Aborting in-flight rpc call");
            slot.state = CallState::Aborted;
            if let Some(socket) = &slot.socket {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
    }

    /// Connects if needed and marks the slot in flight.
    fn checkout_connection(&self) -> RpcResult<(TcpStream, u64)> {
        let mut slot = self.slot.lock().expect("client slot mutex poisoned");

        // A previous abort leaves the slot Aborted with a dead socket.
        if slot.state == CallState::Aborted || slot.socket.is_none() {
            slot.socket = None;
            slot.state = CallState::Idle;
        }

        if slot.socket.is_none() {
            let stream = TcpStream::connect_timeout(&self.endpoint, self.connect_timeout)
                .map_err(RpcError::transport)?;
            stream.set_nodelay(true).map_err(RpcError::transport)?;

            // Connection preamble: the channel name this client speaks.
            let mut preamble = Vec::with_capacity(1 + self.channel.len());
            #[allow(clippy::cast_possible_truncation)] // Checked by limits.
            preamble.push(self.channel.len() as u8);
            preamble.extend_from_slice(self.channel.as_bytes());
            let mut stream_ref = &stream;
            stream_ref.write_all(&preamble).map_err(RpcError::transport)?;

            slot.socket = Some(stream);
        }

        let request_id = slot.next_request_id;
        slot.next_request_id += 1;
        slot.state = CallState::InFlight(request_id);

        let stream = slot
            .socket
            .as_ref()
            .expect("socket present after connect")
            .try_clone()
            .map_err(RpcError::transport)?;
        Ok((stream, request_id))
    }

    /// Finishes a call: resolves the abort race and resets the slot.
    /// Returns the error the caller must surface when an abort won.
    fn checkin_connection(&self, failed: bool) -> Option<RpcError> {
        let mut slot = self.slot.lock().expect("client slot mutex poisoned");
        let was_aborted = slot.state == CallState::Aborted;
        slot.state = CallState::Idle;
        if failed || was_aborted {
            slot.socket = None;
        }
        was_aborted.then_some(RpcError::Aborted)
    }

    /// Writes the request frame and reads one reply frame.
    fn exchange(
        &self,
        mut stream: &TcpStream,
        request: &PeerRpcRequest,
        request_id: u64,
    ) -> RpcResult<PeerRpcReply> {
        let frame = encode_request(request, request_id).map_err(RpcError::transport)?;

        // The timeout starts when bytes are first written.
        stream
            .set_read_timeout(Some(self.call_timeout))
            .map_err(RpcError::transport)?;
        let started = Instant::now();

        stream
            .write_all(&frame)
            .map_err(|e| self.classify(e, started))?;

        let reply_frame = read_frame(stream).map_err(|e| self.classify(e, started))?;
        let (reply_id, reply) = decode_reply(&reply_frame).map_err(RpcError::transport)?;

        if reply_id != request_id || reply.tag != request.tag {
            // The server answered something else entirely; the connection
            // is unusable from here on.
            warn!(
                expected = request_id,
                got = reply_id,
                "Reply did not match the outstanding request"
            );
            return Err(RpcError::transport("mismatched reply"));
        }

        Ok(reply)
    }

    /// Maps an I/O failure to timeout or transport.
    #[allow(clippy::cast_possible_truncation)] // Elapsed millis fit in u64.
    fn classify(&self, err: std::io::Error, started: Instant) -> RpcError {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => RpcError::Timeout {
                waited_ms: started.elapsed().as_millis() as u64,
            },
            _ => RpcError::transport(err),
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .field("channel", &self.channel)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

/// Reads one length-prefixed frame, without the prefix.
pub(crate) fn read_frame(mut stream: &TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > FRAME_SIZE_BYTES_MAX {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut frame = vec![0u8; len as usize];
    stream.read_exact(&mut frame)?;
    Ok(frame)
}
