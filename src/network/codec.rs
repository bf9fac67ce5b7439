//! Peer Codec
//!
//! [`PeerCodec`] turns [`Envelope`]s into length-prefixed frames and back.
//! It plugs into `tokio_util`'s `FramedRead`/`FramedWrite` for stream
//! transports and is called on whole frames by the in-process transport.
//!
//! Frame layout:
//! - `u64` frame length, prefix included
//! - `u8` message type
//! - `u64` sender node id
//! - `u16` identity length, then the identity bytes
//! - the message's fixed fields
//!
//! Append requests end with a `u32` entry count followed by
//! `[u32 len][u64 term][u8 kind][data]` records.

use super::{AppendRequest, AppendResponse, Envelope, PeerAddr, PeerMessage, VoteRequest, VoteResponse};
use crate::raft::{Entry, EntryKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum accepted frame size.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Longest string a frame can carry (`u16` length prefix).
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Length prefix, type, sender and identity length.
const FRAME_HEADER: usize = 8 + 1 + 8 + 2;

/// Term and kind ahead of an entry's data.
const ENTRY_FIXED: usize = 8 + 1;

/// Errors encoding or decoding a frame.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Frame truncated")]
    Truncated,
    #[error("Unknown message type {0}")]
    UnknownType(u8),
    #[error("Frame of {0} bytes exceeds limit")]
    TooLarge(u64),
    #[error("{field} of {len} bytes does not fit its length prefix")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e.to_string())
    }
}

impl PeerMessage {
    fn type_byte(&self) -> u8 {
        match self {
            PeerMessage::Handshake { .. } => 1,
            PeerMessage::HandshakeResponse { .. } => 2,
            PeerMessage::Leave => 3,
            PeerMessage::LeaveResponse => 4,
            PeerMessage::Vote(_) => 5,
            PeerMessage::VoteResponse(_) => 6,
            PeerMessage::AppendEntries(_) => 7,
            PeerMessage::AppendEntriesResponse(_) => 8,
        }
    }
}

/// Frame codec for peer traffic.
#[derive(Debug, Clone)]
pub struct PeerCodec {
    max_frame_size: u64,
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl PeerCodec {
    pub fn new(max_frame_size: u64) -> Self {
        Self { max_frame_size }
    }

    /// Encodes `envelope` as one standalone frame.
    pub fn encode_frame(&mut self, envelope: Envelope) -> Result<BytesMut, WireError> {
        let mut frame = BytesMut::new();
        self.encode(envelope, &mut frame)?;
        Ok(frame)
    }

    /// Decodes a buffer holding exactly one frame.
    pub fn decode_frame(&mut self, mut frame: BytesMut) -> Result<Envelope, WireError> {
        let envelope = self.decode(&mut frame)?.ok_or(WireError::Truncated)?;
        if !frame.is_empty() {
            return Err(WireError::Malformed(format!("{} bytes after frame", frame.len())));
        }
        Ok(envelope)
    }

    fn encode_body(envelope: &Envelope, dst: &mut BytesMut) -> Result<(), WireError> {
        dst.put_u8(envelope.message.type_byte());
        dst.put_u64(envelope.from);
        put_str(dst, "identity", &envelope.identity)?;

        match &envelope.message {
            PeerMessage::Handshake { port } => dst.put_u16(*port),
            PeerMessage::HandshakeResponse { success, leader } => {
                dst.put_u8(u8::from(*success));
                match leader {
                    Some(addr) => {
                        dst.put_u8(1);
                        put_str(dst, "leader host", &addr.host)?;
                        dst.put_u16(addr.port);
                    }
                    None => dst.put_u8(0),
                }
            }
            PeerMessage::Leave | PeerMessage::LeaveResponse => {}
            PeerMessage::Vote(request) => {
                dst.put_u64(request.term);
                dst.put_u64(request.last_log_index);
                dst.put_u64(request.last_log_term);
            }
            PeerMessage::VoteResponse(response) => {
                dst.put_u64(response.term);
                dst.put_u8(u8::from(response.granted));
            }
            PeerMessage::AppendEntries(request) => {
                dst.put_u64(request.term);
                dst.put_u64(request.prev_log_index);
                dst.put_u64(request.prev_log_term);
                dst.put_u64(request.leader_commit);
                let count = u32::try_from(request.entries.len()).map_err(|_| WireError::FieldTooLong {
                    field: "entry list",
                    len: request.entries.len(),
                })?;
                dst.put_u32(count);
                for entry in &request.entries {
                    let len = ENTRY_FIXED + entry.data.len();
                    let record = u32::try_from(len).map_err(|_| WireError::FieldTooLong { field: "entry", len })?;
                    dst.put_u32(record);
                    dst.put_u64(entry.term);
                    dst.put_u8(entry.kind.to_byte());
                    dst.put_slice(&entry.data);
                }
            }
            PeerMessage::AppendEntriesResponse(response) => {
                dst.put_u64(response.term);
                dst.put_u8(u8::from(response.success));
                dst.put_u64(response.match_index);
                dst.put_u64(response.last_index);
            }
        }
        Ok(())
    }

    fn decode_body(frame: &mut Bytes) -> Result<Envelope, WireError> {
        let kind = get_u8(frame)?;
        let from = get_u64(frame)?;
        let identity = get_str(frame)?;

        let message = match kind {
            1 => PeerMessage::Handshake { port: get_u16(frame)? },
            2 => {
                let success = get_u8(frame)? != 0;
                let leader = if get_u8(frame)? != 0 {
                    let host = get_str(frame)?;
                    Some(PeerAddr::new(host, get_u16(frame)?))
                } else {
                    None
                };
                PeerMessage::HandshakeResponse { success, leader }
            }
            3 => PeerMessage::Leave,
            4 => PeerMessage::LeaveResponse,
            5 => PeerMessage::Vote(VoteRequest {
                term: get_u64(frame)?,
                last_log_index: get_u64(frame)?,
                last_log_term: get_u64(frame)?,
            }),
            6 => PeerMessage::VoteResponse(VoteResponse {
                term: get_u64(frame)?,
                granted: get_u8(frame)? != 0,
            }),
            7 => {
                let term = get_u64(frame)?;
                let prev_log_index = get_u64(frame)?;
                let prev_log_term = get_u64(frame)?;
                let leader_commit = get_u64(frame)?;
                let count = get_u32(frame)? as usize;
                // Each record needs at least its length prefix and fixed fields.
                if count > frame.remaining() / (4 + ENTRY_FIXED) {
                    return Err(WireError::Malformed(format!("{count} entries in {} bytes", frame.remaining())));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let record_len = get_u32(frame)? as usize;
                    if record_len < ENTRY_FIXED {
                        return Err(WireError::Malformed(format!("entry record of {record_len} bytes")));
                    }
                    let term = get_u64(frame)?;
                    let kind = get_u8(frame)?;
                    let kind = EntryKind::from_byte(kind)
                        .ok_or_else(|| WireError::Malformed(format!("unknown entry kind {kind}")))?;
                    let data = get_bytes(frame, record_len - ENTRY_FIXED)?;
                    entries.push(Entry::with_kind(term, kind, data.to_vec()));
                }
                PeerMessage::AppendEntries(AppendRequest {
                    term,
                    prev_log_index,
                    prev_log_term,
                    leader_commit,
                    entries,
                })
            }
            8 => PeerMessage::AppendEntriesResponse(AppendResponse {
                term: get_u64(frame)?,
                success: get_u8(frame)? != 0,
                match_index: get_u64(frame)?,
                last_index: get_u64(frame)?,
            }),
            other => return Err(WireError::UnknownType(other)),
        };

        if frame.has_remaining() {
            return Err(WireError::Malformed(format!("{} trailing bytes", frame.remaining())));
        }
        Ok(Envelope {
            identity,
            from,
            message,
        })
    }
}

impl Encoder<Envelope> for PeerCodec {
    type Error = WireError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.reserve(64);
        dst.put_u64(0);

        let result = Self::encode_body(&item, dst).and_then(|()| {
            let len = (dst.len() - start) as u64;
            if len > self.max_frame_size {
                return Err(WireError::TooLarge(len));
            }
            dst[start..start + 8].copy_from_slice(&len.to_be_bytes());
            Ok(())
        });
        // A rejected message leaves nothing behind in the write buffer.
        if result.is_err() {
            dst.truncate(start);
        }
        result
    }
}

impl Decoder for PeerCodec {
    type Item = Envelope;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }
        let len = (&src[..8]).get_u64();
        if len > self.max_frame_size {
            return Err(WireError::TooLarge(len));
        }
        if len < FRAME_HEADER as u64 {
            return Err(WireError::Malformed(format!("frame length {len}")));
        }

        let len = len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len).freeze();
        frame.advance(8);
        Self::decode_body(&mut frame).map(Some)
    }
}

fn put_str(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn need(frame: &Bytes, len: usize) -> Result<(), WireError> {
    if frame.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(())
}

fn get_u8(frame: &mut Bytes) -> Result<u8, WireError> {
    need(frame, 1)?;
    Ok(frame.get_u8())
}

fn get_u16(frame: &mut Bytes) -> Result<u16, WireError> {
    need(frame, 2)?;
    Ok(frame.get_u16())
}

fn get_u32(frame: &mut Bytes) -> Result<u32, WireError> {
    need(frame, 4)?;
    Ok(frame.get_u32())
}

fn get_u64(frame: &mut Bytes) -> Result<u64, WireError> {
    need(frame, 8)?;
    Ok(frame.get_u64())
}

fn get_bytes(frame: &mut Bytes, len: usize) -> Result<Bytes, WireError> {
    need(frame, len)?;
    Ok(frame.split_to(len))
}

fn get_str(frame: &mut Bytes) -> Result<String, WireError> {
    let len = get_u16(frame)? as usize;
    let bytes = get_bytes(frame, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| WireError::Malformed(e.to_string()))
}
