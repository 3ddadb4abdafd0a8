//! Fixed-capacity data frames: the byte containers that aggregate serialized
//! operation records into single durable-log appends.
//!
//! The chunk layout inside a frame is shared with whatever reads the log back
//! later; the processor itself never re-reads frames.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, StoreError};
use crate::log::LogAddress;
use crate::ops::NO_SEQUENCE;

/// Per-chunk header: payload length (u32), flags (u8), sequence (u64).
const CHUNK_HEADER_LEN: usize = 13;
const FLAG_FIRST: u8 = 0x1;
const FLAG_LAST: u8 = 0x2;

/// Smallest useful frame: one chunk header plus some payload.
pub(crate) const MIN_FRAME_CAPACITY: usize = 64;

/// Metadata describing a sealed frame through its write lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameArgs {
    /// Builder-assigned dense frame id, in seal order.
    pub frame_id: u64,
    /// Sequence number of the last operation whose serialization began in or
    /// before this frame ([`NO_SEQUENCE`] for a frame with no records).
    pub last_started_sequence: u64,
    /// Sequence number of the last operation whose serialization completed in
    /// this frame. Equal to `last_started_sequence` iff the frame ends on an
    /// operation boundary.
    pub last_fully_serialized_sequence: u64,
    /// Frame length in bytes.
    pub length: usize,
    /// Durable-log address; populated once the log acknowledges the write.
    pub address: Option<LogAddress>,
}

/// An in-progress frame accepting operation record chunks.
#[derive(Debug)]
pub(crate) struct DataFrame {
    id: u64,
    capacity: usize,
    buf: BytesMut,
    last_started_sequence: u64,
    last_fully_serialized_sequence: u64,
}

impl DataFrame {
    pub(crate) fn new(id: u64, capacity: usize) -> Self {
        debug_assert!(capacity >= MIN_FRAME_CAPACITY);
        Self {
            id,
            capacity,
            buf: BytesMut::with_capacity(capacity),
            last_started_sequence: NO_SEQUENCE,
            last_fully_serialized_sequence: NO_SEQUENCE,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes as much of `remaining` as fits, preceded by a chunk header.
    /// Returns the number of payload bytes consumed; 0 means the frame has no
    /// room for another chunk and must be sealed.
    pub(crate) fn append_chunk(&mut self, sequence: u64, remaining: &[u8], first: bool) -> usize {
        let free = self.capacity - self.buf.len();
        if free <= CHUNK_HEADER_LEN {
            return 0;
        }
        let take = remaining.len().min(free - CHUNK_HEADER_LEN);
        let last = take == remaining.len();
        let mut flags = 0u8;
        if first {
            flags |= FLAG_FIRST;
        }
        if last {
            flags |= FLAG_LAST;
        }
        self.buf.put_u32(take as u32);
        self.buf.put_u8(flags);
        self.buf.put_u64(sequence);
        self.buf.put_slice(&remaining[..take]);
        // A continuation chunk counts too: the record began before this frame.
        self.last_started_sequence = sequence;
        if last {
            self.last_fully_serialized_sequence = sequence;
        }
        take
    }

    /// Consumes the frame, producing its write metadata and payload.
    pub(crate) fn seal(self) -> (FrameArgs, Bytes) {
        let args = FrameArgs {
            frame_id: self.id,
            last_started_sequence: self.last_started_sequence,
            last_fully_serialized_sequence: self.last_fully_serialized_sequence,
            length: self.buf.len(),
            address: None,
        };
        (args, self.buf.freeze())
    }
}

/// One parsed chunk of an operation record inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameChunk {
    /// Sequence number of the owning operation.
    pub sequence: u64,
    /// Whether this chunk starts the record.
    pub first: bool,
    /// Whether this chunk completes the record.
    pub last: bool,
    /// Chunk payload.
    pub payload: Bytes,
}

/// Parses the chunks of a frame payload, for readers downstream of the log.
pub fn read_chunks(frame: &[u8]) -> Result<Vec<FrameChunk>> {
    let mut chunks = Vec::new();
    let mut pos = 0usize;
    while pos < frame.len() {
        if frame.len() - pos < CHUNK_HEADER_LEN {
            return Err(StoreError::Corruption("truncated frame chunk header".into()));
        }
        let len = u32::from_be_bytes(frame[pos..pos + 4].try_into().expect("len 4")) as usize;
        let flags = frame[pos + 4];
        let sequence = u64::from_be_bytes(frame[pos + 5..pos + 13].try_into().expect("len 8"));
        pos += CHUNK_HEADER_LEN;
        if frame.len() - pos < len {
            return Err(StoreError::Corruption("truncated frame chunk payload".into()));
        }
        chunks.push(FrameChunk {
            sequence,
            first: flags & FLAG_FIRST != 0,
            last: flags & FLAG_LAST != 0,
            payload: Bytes::copy_from_slice(&frame[pos..pos + len]),
        });
        pos += len;
    }
    Ok(chunks)
}
