//! The binary RPC codec.
//!
//! Every frame starts with a one-byte message tag followed by the message's
//! fields, packed little-endian. Entries inside an AppendEntries frame are
//! serialized inline as `term ++ index ++ kind ++ cmd_len ++ cmd_bytes`.
//! Decoders bounds-check every length before reading; a malformed frame is
//! rejected with [`RaftError::Corruption`] and never panics.

use std::convert::TryInto;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::EntryKind;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::PreVoteRequest;
use crate::raft::PreVoteResponse;
use crate::raft::TimeoutNow;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;

const TAG_REQUEST_VOTE: u8 = 1;
const TAG_REQUEST_VOTE_RESP: u8 = 2;
const TAG_APPEND_ENTRIES: u8 = 3;
const TAG_APPEND_ENTRIES_RESP: u8 = 4;
const TAG_INSTALL_SNAPSHOT: u8 = 5;
const TAG_INSTALL_SNAPSHOT_RESP: u8 = 6;
const TAG_PRE_VOTE: u8 = 7;
const TAG_PRE_VOTE_RESP: u8 = 8;
const TAG_TIMEOUT_NOW: u8 = 9;

/// A decoded RPC frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    RequestVote(VoteRequest),
    RequestVoteResp(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResp(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResp(InstallSnapshotResponse),
    PreVote(PreVoteRequest),
    PreVoteResp(PreVoteResponse),
    TimeoutNow(TimeoutNow),
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Encode a message into a transport frame.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    match msg {
        Message::RequestVote(req) => {
            buf.push(TAG_REQUEST_VOTE);
            put_u64(&mut buf, req.term);
            put_u32(&mut buf, req.candidate_id);
            put_u64(&mut buf, req.last_log_index);
            put_u64(&mut buf, req.last_log_term);
        }
        Message::RequestVoteResp(resp) => {
            buf.push(TAG_REQUEST_VOTE_RESP);
            put_u64(&mut buf, resp.term);
            buf.push(resp.vote_granted as u8);
        }
        Message::AppendEntries(req) => {
            buf.push(TAG_APPEND_ENTRIES);
            put_u64(&mut buf, req.term);
            put_u32(&mut buf, req.leader_id);
            put_u64(&mut buf, req.prev_log_index);
            put_u64(&mut buf, req.prev_log_term);
            put_u64(&mut buf, req.leader_commit);
            put_u32(&mut buf, req.entries.len() as u32);
            for entry in &req.entries {
                put_u64(&mut buf, entry.term);
                put_u64(&mut buf, entry.index);
                buf.push(entry.kind.as_u8());
                put_u32(&mut buf, entry.payload.len() as u32);
                buf.extend_from_slice(&entry.payload);
            }
        }
        Message::AppendEntriesResp(resp) => {
            buf.push(TAG_APPEND_ENTRIES_RESP);
            put_u64(&mut buf, resp.term);
            buf.push(resp.success as u8);
            put_u64(&mut buf, resp.match_index);
        }
        Message::InstallSnapshot(req) => {
            buf.push(TAG_INSTALL_SNAPSHOT);
            put_u64(&mut buf, req.term);
            put_u32(&mut buf, req.leader_id);
            put_u64(&mut buf, req.last_index);
            put_u64(&mut buf, req.last_term);
            put_u64(&mut buf, req.offset);
            buf.push(req.done as u8);
            put_u32(&mut buf, req.data.len() as u32);
            buf.extend_from_slice(&req.data);
        }
        Message::InstallSnapshotResp(resp) => {
            buf.push(TAG_INSTALL_SNAPSHOT_RESP);
            put_u64(&mut buf, resp.term);
        }
        Message::PreVote(req) => {
            buf.push(TAG_PRE_VOTE);
            put_u64(&mut buf, req.term);
            put_u32(&mut buf, req.candidate_id);
            put_u64(&mut buf, req.last_log_index);
            put_u64(&mut buf, req.last_log_term);
        }
        Message::PreVoteResp(resp) => {
            buf.push(TAG_PRE_VOTE_RESP);
            put_u64(&mut buf, resp.term);
            buf.push(resp.vote_granted as u8);
        }
        Message::TimeoutNow(req) => {
            buf.push(TAG_TIMEOUT_NOW);
            put_u64(&mut buf, req.term);
            put_u32(&mut buf, req.leader_id);
        }
    }
    buf
}

/// Decode a transport frame.
pub fn decode(frame: &[u8]) -> RaftResult<Message> {
    let mut reader = FrameReader::new(frame);
    let tag = reader.u8()?;
    let msg = match tag {
        TAG_REQUEST_VOTE => Message::RequestVote(VoteRequest {
            term: reader.u64()?,
            candidate_id: reader.u32()?,
            last_log_index: reader.u64()?,
            last_log_term: reader.u64()?,
        }),
        TAG_REQUEST_VOTE_RESP => Message::RequestVoteResp(VoteResponse {
            term: reader.u64()?,
            vote_granted: reader.bool()?,
        }),
        TAG_APPEND_ENTRIES => {
            let term = reader.u64()?;
            let leader_id = reader.u32()?;
            let prev_log_index = reader.u64()?;
            let prev_log_term = reader.u64()?;
            let leader_commit = reader.u64()?;
            let count = reader.u32()?;
            let mut entries = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let term = reader.u64()?;
                let index = reader.u64()?;
                let kind = EntryKind::from_u8(reader.u8()?)
                    .ok_or_else(|| RaftError::Corruption("unknown entry kind in frame".into()))?;
                let len = reader.u32()?;
                let payload = reader.bytes(len as usize)?.to_vec();
                entries.push(Entry {
                    term,
                    index,
                    kind,
                    payload,
                });
            }
            Message::AppendEntries(AppendEntriesRequest {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            })
        }
        TAG_APPEND_ENTRIES_RESP => Message::AppendEntriesResp(AppendEntriesResponse {
            term: reader.u64()?,
            success: reader.bool()?,
            match_index: reader.u64()?,
        }),
        TAG_INSTALL_SNAPSHOT => {
            let term = reader.u64()?;
            let leader_id = reader.u32()?;
            let last_index = reader.u64()?;
            let last_term = reader.u64()?;
            let offset = reader.u64()?;
            let done = reader.bool()?;
            let len = reader.u32()?;
            let data = reader.bytes(len as usize)?.to_vec();
            Message::InstallSnapshot(InstallSnapshotRequest {
                term,
                leader_id,
                last_index,
                last_term,
                offset,
                done,
                data,
            })
        }
        TAG_INSTALL_SNAPSHOT_RESP => Message::InstallSnapshotResp(InstallSnapshotResponse { term: reader.u64()? }),
        TAG_PRE_VOTE => Message::PreVote(PreVoteRequest {
            term: reader.u64()?,
            candidate_id: reader.u32()?,
            last_log_index: reader.u64()?,
            last_log_term: reader.u64()?,
        }),
        TAG_PRE_VOTE_RESP => Message::PreVoteResp(PreVoteResponse {
            term: reader.u64()?,
            vote_granted: reader.bool()?,
        }),
        TAG_TIMEOUT_NOW => Message::TimeoutNow(TimeoutNow {
            term: reader.u64()?,
            leader_id: reader.u32()?,
        }),
        other => return Err(RaftError::Corruption(format!("unknown message tag {}", other))),
    };
    reader.finish()?;
    Ok(msg)
}

/// Bounds-checked cursor over a received frame.
struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FrameReader { buf, pos: 0 }
    }

    fn u8(&mut self) -> RaftResult<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn bool(&mut self) -> RaftResult<bool> {
        Ok(self.u8()? != 0)
    }

    fn u32(&mut self) -> RaftResult<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> RaftResult<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self, len: usize) -> RaftResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn finish(&self) -> RaftResult<()> {
        if self.pos != self.buf.len() {
            return Err(RaftError::Corruption("trailing bytes in frame".into()));
        }
        Ok(())
    }
}

fn truncated() -> RaftError {
    RaftError::Corruption("truncated frame".into())
}
