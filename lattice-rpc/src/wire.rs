//! Wire envelope for the peer protocol.
//!
//! Raft RPCs travel wrapped in [`PeerRpcRequest`] and [`PeerRpcReply`]:
//! wide records with a tag selecting which payload field is meaningful.
//! The roadmap is to evolve this into a sum type on the wire, but interop
//! with existing peers requires the wide-record form for now; the codec
//! already serialises field-by-field per tag, never echoing the unused
//! fields.
//!
//! # Frame Format
//!
//! ```text
//! | length(u32 LE) | request_id(u64 LE) | tag(u8) | payload |
//! ```
//!
//! `length` counts everything after itself. Log entries carry their delta
//! in the durable record framing (including the rolling hash word), so a
//! replicated record is bit-identical to the one the leader's WAL wrote.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lattice_core::{LogIndex, NodeId, TermId};
use lattice_durability::{HashedReader, HashedWriter, StateDelta};
use lattice_raft::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RequestVoteRequest, RequestVoteResponse,
};
use thiserror::Error;

use crate::limits::FRAME_SIZE_BYTES_MAX;

/// The channel name carried in every connection preamble.
pub const RAFT_CHANNEL_NAME: &str = "raft-peer-rpc-channel";

/// Request/reply tag of the peer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcTag {
    /// A `RequestVote` exchange.
    RequestVote = 1,
    /// An `AppendEntries` exchange.
    AppendEntries = 2,
}

impl RpcTag {
    /// Parses a wire tag.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RequestVote),
            2 => Some(Self::AppendEntries),
            _ => None,
        }
    }
}

/// Wire-level codec errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size.
        size: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// Unknown request/reply tag.
    #[error("unknown rpc tag: {tag}")]
    UnknownTag {
        /// The unknown tag value.
        tag: u8,
    },

    /// Not enough bytes to decode.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// A log entry's delta payload failed to decode.
    #[error("bad delta payload: {0}")]
    BadDelta(#[from] lattice_durability::DurabilityError),
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// The request envelope: a wide record, tag selects the meaningful field.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRpcRequest {
    /// Which payload field is set.
    pub tag: RpcTag,
    /// Set when `tag` is [`RpcTag::RequestVote`].
    pub request_vote: Option<RequestVoteRequest>,
    /// Set when `tag` is [`RpcTag::AppendEntries`].
    pub append_entries: Option<AppendEntriesRequest>,
}

impl PeerRpcRequest {
    /// Wraps a `RequestVote` request.
    #[must_use]
    pub const fn request_vote(request: RequestVoteRequest) -> Self {
        Self {
            tag: RpcTag::RequestVote,
            request_vote: Some(request),
            append_entries: None,
        }
    }

    /// Wraps an `AppendEntries` request.
    #[must_use]
    pub const fn append_entries(request: AppendEntriesRequest) -> Self {
        Self {
            tag: RpcTag::AppendEntries,
            request_vote: None,
            append_entries: Some(request),
        }
    }
}

/// The reply envelope, mirroring the request tag.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRpcReply {
    /// Which payload field is set.
    pub tag: RpcTag,
    /// Set when `tag` is [`RpcTag::RequestVote`].
    pub request_vote: Option<RequestVoteResponse>,
    /// Set when `tag` is [`RpcTag::AppendEntries`].
    pub append_entries: Option<AppendEntriesResponse>,
}

impl PeerRpcReply {
    /// Wraps a `RequestVote` response.
    #[must_use]
    pub const fn request_vote(response: RequestVoteResponse) -> Self {
        Self {
            tag: RpcTag::RequestVote,
            request_vote: Some(response),
            append_entries: None,
        }
    }

    /// Wraps an `AppendEntries` response.
    #[must_use]
    pub const fn append_entries(response: AppendEntriesResponse) -> Self {
        Self {
            tag: RpcTag::AppendEntries,
            request_vote: None,
            append_entries: Some(response),
        }
    }
}

/// Encodes a request frame.
///
/// # Errors
/// Returns `FrameTooLarge` if the encoded frame exceeds the limit.
pub fn encode_request(request: &PeerRpcRequest, request_id: u64) -> WireResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u32_le(0); // Length, filled in below.
    buf.put_u64_le(request_id);
    buf.put_u8(request.tag as u8);

    match request.tag {
        RpcTag::RequestVote => {
            let req = request
                .request_vote
                .as_ref()
                .expect("request_vote set for its tag");
            buf.put_u64_le(req.term.get());
            buf.put_u64_le(req.candidate_id.get());
            buf.put_u64_le(req.to.get());
            buf.put_u64_le(req.last_log_index.get());
            buf.put_u64_le(req.last_log_term.get());
        }
        RpcTag::AppendEntries => {
            let req = request
                .append_entries
                .as_ref()
                .expect("append_entries set for its tag");
            buf.put_u64_le(req.term.get());
            buf.put_u64_le(req.leader_id.get());
            buf.put_u64_le(req.to.get());
            buf.put_u64_le(req.prev_log_index.get());
            buf.put_u64_le(req.prev_log_term.get());
            buf.put_u64_le(req.leader_commit.get());
            #[allow(clippy::cast_possible_truncation)] // Batch size is limited.
            buf.put_u32_le(req.entries.len() as u32);
            for entry in &req.entries {
                encode_entry(&mut buf, entry)?;
            }
        }
    }

    finish_frame(buf)
}

/// Decodes a request frame (without the length prefix).
///
/// # Errors
/// Returns `UnknownTag` for an unrecognised tag, `InsufficientData` for a
/// short frame.
pub fn decode_request(frame: &[u8]) -> WireResult<(u64, PeerRpcRequest)> {
    let mut buf = frame;
    let request_id = take_u64(&mut buf)?;
    let tag_byte = take_u8(&mut buf)?;
    let tag = RpcTag::from_u8(tag_byte).ok_or(WireError::UnknownTag { tag: tag_byte })?;

    let request = match tag {
        RpcTag::RequestVote => PeerRpcRequest::request_vote(RequestVoteRequest::new(
            TermId::new(take_u64(&mut buf)?),
            NodeId::new(take_u64(&mut buf)?),
            NodeId::new(take_u64(&mut buf)?),
            LogIndex::new(take_u64(&mut buf)?),
            TermId::new(take_u64(&mut buf)?),
        )),
        RpcTag::AppendEntries => {
            let term = TermId::new(take_u64(&mut buf)?);
            let leader_id = NodeId::new(take_u64(&mut buf)?);
            let to = NodeId::new(take_u64(&mut buf)?);
            let prev_log_index = LogIndex::new(take_u64(&mut buf)?);
            let prev_log_term = TermId::new(take_u64(&mut buf)?);
            let leader_commit = LogIndex::new(take_u64(&mut buf)?);
            let count = take_u32(&mut buf)? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                entries.push(decode_entry(&mut buf)?);
            }
            PeerRpcRequest::append_entries(AppendEntriesRequest::new(
                term,
                leader_id,
                to,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ))
        }
    };

    Ok((request_id, request))
}

/// Encodes a reply frame.
///
/// # Errors
/// Returns `FrameTooLarge` if the encoded frame exceeds the limit.
pub fn encode_reply(reply: &PeerRpcReply, request_id: u64) -> WireResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32_le(0);
    buf.put_u64_le(request_id);
    buf.put_u8(reply.tag as u8);

    match reply.tag {
        RpcTag::RequestVote => {
            let resp = reply
                .request_vote
                .as_ref()
                .expect("request_vote set for its tag");
            buf.put_u64_le(resp.term.get());
            buf.put_u64_le(resp.from.get());
            buf.put_u64_le(resp.to.get());
            buf.put_u8(u8::from(resp.vote_granted));
        }
        RpcTag::AppendEntries => {
            let resp = reply
                .append_entries
                .as_ref()
                .expect("append_entries set for its tag");
            buf.put_u64_le(resp.term.get());
            buf.put_u64_le(resp.from.get());
            buf.put_u64_le(resp.to.get());
            buf.put_u8(u8::from(resp.success));
            buf.put_u64_le(resp.match_index.get());
        }
    }

    finish_frame(buf)
}

/// Decodes a reply frame (without the length prefix).
///
/// # Errors
/// Returns `UnknownTag` for an unrecognised tag, `InsufficientData` for a
/// short frame.
pub fn decode_reply(frame: &[u8]) -> WireResult<(u64, PeerRpcReply)> {
    let mut buf = frame;
    let request_id = take_u64(&mut buf)?;
    let tag_byte = take_u8(&mut buf)?;
    let tag = RpcTag::from_u8(tag_byte).ok_or(WireError::UnknownTag { tag: tag_byte })?;

    let reply = match tag {
        RpcTag::RequestVote => PeerRpcReply::request_vote(RequestVoteResponse::new(
            TermId::new(take_u64(&mut buf)?),
            NodeId::new(take_u64(&mut buf)?),
            NodeId::new(take_u64(&mut buf)?),
            take_u8(&mut buf)? != 0,
        )),
        RpcTag::AppendEntries => {
            let term = TermId::new(take_u64(&mut buf)?);
            let from = NodeId::new(take_u64(&mut buf)?);
            let to = NodeId::new(take_u64(&mut buf)?);
            let success = take_u8(&mut buf)? != 0;
            let match_index = LogIndex::new(take_u64(&mut buf)?);
            PeerRpcReply::append_entries(AppendEntriesResponse::new(
                term, from, to, success, match_index,
            ))
        }
    };

    Ok((request_id, reply))
}

/// Encodes one log entry: term, index, then the delta in its durable
/// record framing (rolling hash included).
fn encode_entry(buf: &mut BytesMut, entry: &LogEntry) -> WireResult<()> {
    buf.put_u64_le(entry.term.get());
    buf.put_u64_le(entry.index.get());

    let mut writer = HashedWriter::new(Vec::new());
    entry.delta.encode(&mut writer)?;
    let payload = writer.get_ref();
    #[allow(clippy::cast_possible_truncation)] // Bounded by FRAME_SIZE_BYTES_MAX.
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Decodes one log entry, verifying the delta's record hash.
fn decode_entry(buf: &mut &[u8]) -> WireResult<LogEntry> {
    let term = TermId::new(take_u64(buf)?);
    let index = LogIndex::new(take_u64(buf)?);
    let len = take_u32(buf)? as usize;
    if buf.len() < len {
        return Err(WireError::InsufficientData {
            need: len,
            have: buf.len(),
        });
    }
    let (payload, rest) = buf.split_at(len);
    *buf = rest;

    let mut reader = HashedReader::new(payload);
    let delta = StateDelta::decode(&mut reader)?;
    Ok(LogEntry::new(term, index, delta))
}

/// Writes the length prefix and enforces the frame limit.
fn finish_frame(mut buf: BytesMut) -> WireResult<Bytes> {
    #[allow(clippy::cast_possible_truncation)] // Checked against the limit below.
    let len = (buf.len() - 4) as u32;
    if len > FRAME_SIZE_BYTES_MAX {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: FRAME_SIZE_BYTES_MAX,
        });
    }
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    Ok(buf.freeze())
}

fn take_u8(buf: &mut &[u8]) -> WireResult<u8> {
    if buf.is_empty() {
        return Err(WireError::InsufficientData { need: 1, have: 0 });
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> WireResult<u32> {
    if buf.len() < 4 {
        return Err(WireError::InsufficientData {
            need: 4,
            have: buf.len(),
        });
    }
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8]) -> WireResult<u64> {
    if buf.len() < 8 {
        return Err(WireError::InsufficientData {
            need: 8,
            have: buf.len(),
        });
    }
    Ok(buf.get_u64_le())
}
