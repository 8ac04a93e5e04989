//! Wire frames.
//!
//! A [`Frame`] is one unit written to or read from the transport. Layout
//! (integers big-endian):
//!
//! ```text
//! Whole: [0x00][payload ...]
//! Split: [0x01][transfer id: 16][sequence index: u32][total chunks: u32]
//!        [total size: u64][chunk ...]
//! ```

use super::TransferId;
use crate::error::CodecError;

const WHOLE_KIND: u8 = 0x00;
const SPLIT_KIND: u8 = 0x01;

/// Bytes following the kind byte in a split frame, before the chunk.
pub const SPLIT_HEADER_LEN: usize = 16 + 4 + 4 + 8;

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A fully encoded message.
    Whole(Vec<u8>),
    /// One chunk of a message that exceeded the split threshold.
    Split(SplitChunk),
}

/// One piece of a split transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitChunk {
    /// Transfer all chunks of the message share.
    pub transfer_id: TransferId,
    /// Zero-based position of this chunk.
    pub sequence_index: u32,
    /// Number of chunks in the transfer, fixed before the first is sent.
    pub total_chunks: u32,
    /// Encoded length of the whole message.
    pub total_size: u64,
    /// Chunk payload.
    pub chunk: Vec<u8>,
}

impl Frame {
    /// Serializes the frame into its wire representation.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Whole(payload) => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(WHOLE_KIND);
                out.extend_from_slice(payload);
                out
            }
            Self::Split(split) => {
                let mut out = Vec::with_capacity(1 + SPLIT_HEADER_LEN + split.chunk.len());
                out.push(SPLIT_KIND);
                out.extend_from_slice(split.transfer_id.as_bytes());
                out.extend_from_slice(&split.sequence_index.to_be_bytes());
                out.extend_from_slice(&split.total_chunks.to_be_bytes());
                out.extend_from_slice(&split.total_size.to_be_bytes());
                out.extend_from_slice(&split.chunk);
                out
            }
        }
    }

    /// Parses a frame from its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] when the buffer is shorter than the
    /// frame header and [`CodecError::UnknownFrameKind`] for an unrecognised
    /// kind byte.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let Some((&kind, rest)) = bytes.split_first() else {
            return Err(CodecError::Truncated {
                expected: 1,
                actual: 0,
            });
        };

        match kind {
            WHOLE_KIND => Ok(Self::Whole(rest.to_vec())),
            SPLIT_KIND => {
                let truncated = CodecError::Truncated {
                    expected: 1 + SPLIT_HEADER_LEN,
                    actual: bytes.len(),
                };
                let mut reader = HeaderReader { buf: rest };
                let (Some(id), Some(index), Some(total), Some(size)) = (
                    reader.take::<16>(),
                    reader.take::<4>(),
                    reader.take::<4>(),
                    reader.take::<8>(),
                ) else {
                    return Err(truncated);
                };
                Ok(Self::Split(SplitChunk {
                    transfer_id: TransferId::from_bytes(id),
                    sequence_index: u32::from_be_bytes(index),
                    total_chunks: u32::from_be_bytes(total),
                    total_size: u64::from_be_bytes(size),
                    chunk: reader.buf.to_vec(),
                }))
            }
            other => Err(CodecError::UnknownFrameKind(other)),
        }
    }

    /// Number of payload bytes carried by this frame (header excluded).
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Whole(payload) => payload.len(),
            Self::Split(split) => split.chunk.len(),
        }
    }
}

/// Cursor over a split frame header.
struct HeaderReader<'a> {
    buf: &'a [u8],
}

impl HeaderReader<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let (head, tail) = self.buf.split_at_checked(N)?;
        self.buf = tail;
        head.try_into().ok()
    }
}
