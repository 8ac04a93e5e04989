//! Message ⇄ frame transform.
//!
//! [`encode`] serializes a [`Message`] and emits one whole frame, or, when
//! the encoded length exceeds the split threshold, `ceil(len / chunk_size)`
//! split frames sharing one [`TransferId`]. A [`Decoder`] stages split
//! chunks per transfer until every index is present, then decodes the
//! concatenation as one message and forgets the transfer. Staging is
//! bounded: transfers idle past `transfer_idle_timeout` are dropped, and
//! at most `max_pending_transfers` are staged at once.
//!
//! The codec does no I/O. [`Decoder::reassemble`] and [`decode_message`]
//! are exposed separately so parsing of a large payload can move off the
//! read loop without changing the result ([`decode_offloaded`]).

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use super::frame::{Frame, SplitChunk};
use super::progress::ProgressState;
use super::{Message, TransferId};
use crate::config::CodecConfig;
use crate::error::{CodecError, ServiceError};

/// Frames produced for one message.
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Transfer the frames belong to.
    pub transfer_id: TransferId,
    /// Frames in transmission order.
    pub frames: Vec<Frame>,
    /// Encoded message length in bytes.
    pub total_size: usize,
}

impl Encoded {
    /// Returns `true` if the message was split.
    #[must_use]
    pub fn is_split(&self) -> bool {
        matches!(self.frames.first(), Some(Frame::Split(_)))
    }
}

/// Serializes `message` and partitions it into frames.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails and
/// [`CodecError::TooLarge`] if the encoded message exceeds
/// `config.max_message_size`.
pub fn encode(
    config: &CodecConfig,
    transfer_id: TransferId,
    message: &Message,
) -> Result<Encoded, CodecError> {
    let payload = serde_json::to_vec(message)?;
    encode_payload(config, transfer_id, payload)
}

/// Partitions an already-serialized payload into frames.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if the payload exceeds
/// `config.max_message_size`.
pub fn encode_payload(
    config: &CodecConfig,
    transfer_id: TransferId,
    payload: Vec<u8>,
) -> Result<Encoded, CodecError> {
    let total_size = payload.len();
    if total_size > config.max_message_size {
        return Err(CodecError::TooLarge {
            size: total_size as u64,
            limit: config.max_message_size as u64,
        });
    }

    if total_size <= config.split_threshold {
        return Ok(Encoded {
            transfer_id,
            frames: vec![Frame::Whole(payload)],
            total_size,
        });
    }

    let chunk_size = config.chunk_size.max(1);
    let total_chunks = u32::try_from(total_size.div_ceil(chunk_size)).map_err(|_| {
        CodecError::TooLarge {
            size: total_size as u64,
            limit: config.max_message_size as u64,
        }
    })?;

    let frames = payload
        .chunks(chunk_size)
        .zip(0u32..)
        .map(|(chunk, sequence_index)| {
            Frame::Split(SplitChunk {
                transfer_id,
                sequence_index,
                total_chunks,
                total_size: total_size as u64,
                chunk: chunk.to_vec(),
            })
        })
        .collect();

    Ok(Encoded {
        transfer_id,
        frames,
        total_size,
    })
}

/// Parses a complete payload into a [`Message`].
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the payload is not a valid message.
pub fn decode_message(payload: &[u8]) -> Result<Message, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Parses a complete payload, moving payloads longer than `inline_limit`
/// to the blocking thread pool.
///
/// # Errors
///
/// Returns [`ServiceError::Codec`] if the payload is not a valid message,
/// or [`ServiceError::Internal`] if the parser task fails.
pub async fn decode_offloaded(
    payload: Vec<u8>,
    inline_limit: usize,
) -> Result<Message, ServiceError> {
    if payload.len() <= inline_limit {
        return Ok(decode_message(&payload)?);
    }
    match tokio::task::spawn_blocking(move || decode_message(&payload)).await {
        Ok(result) => Ok(result?),
        Err(err) => Err(ServiceError::Internal(format!("payload parser failed: {err}"))),
    }
}

/// Outcome of feeding one frame to [`Decoder::reassemble`].
#[derive(Debug)]
pub enum Reassembled {
    /// A split transfer advanced but is not complete yet.
    Progress(ProgressState),
    /// A full payload is available.
    Complete {
        /// Raw message bytes.
        payload: Vec<u8>,
        /// Final snapshot when the payload arrived in split frames.
        progress: Option<ProgressState>,
    },
}

/// Outcome of feeding one frame to [`Decoder::decode`].
#[derive(Debug)]
pub enum Decoded {
    /// A split transfer advanced but is not complete yet.
    Progress(ProgressState),
    /// A message is complete.
    Complete(Message),
}

/// Chunks received so far for one transfer.
#[derive(Debug)]
struct Staging {
    total_chunks: u32,
    total_size: u64,
    chunks: BTreeMap<u32, Vec<u8>>,
    received: u64,
    last_seen: Instant,
}

/// Stateful frame decoder for one connection.
///
/// Holds the split staging buffers; drop it (or call [`Decoder::clear`])
/// when the connection closes.
#[derive(Debug)]
pub struct Decoder {
    config: CodecConfig,
    staging: HashMap<TransferId, Staging>,
}

impl Decoder {
    /// Creates a decoder with empty staging.
    #[must_use]
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            staging: HashMap::new(),
        }
    }

    /// Decodes one frame, reassembling split transfers.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for malformed frames, inconsistent split
    /// headers, or an invalid message payload. The affected transfer is
    /// discarded; other transfers are unaffected.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Decoded, CodecError> {
        match self.reassemble(frame)? {
            Reassembled::Progress(state) => Ok(Decoded::Progress(state)),
            Reassembled::Complete { payload, .. } => {
                decode_message(&payload).map(Decoded::Complete)
            }
        }
    }

    /// Stages one frame without parsing the message.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for malformed frames or inconsistent split
    /// headers. The affected transfer's staging is discarded.
    pub fn reassemble(&mut self, frame: &[u8]) -> Result<Reassembled, CodecError> {
        match Frame::parse(frame)? {
            Frame::Whole(payload) => {
                if payload.len() > self.config.max_message_size {
                    return Err(CodecError::TooLarge {
                        size: payload.len() as u64,
                        limit: self.config.max_message_size as u64,
                    });
                }
                Ok(Reassembled::Complete {
                    payload,
                    progress: None,
                })
            }
            Frame::Split(split) => {
                let transfer_id = split.transfer_id;
                self.evict(&transfer_id, Instant::now());
                let result = self.stage(split);
                if result.is_err() {
                    self.staging.remove(&transfer_id);
                }
                result
            }
        }
    }

    /// Number of split transfers currently staged.
    #[must_use]
    pub fn pending_transfers(&self) -> usize {
        self.staging.len()
    }

    /// Drops the staging buffer of one transfer.
    pub fn clear_transfer(&mut self, transfer_id: &TransferId) {
        self.staging.remove(transfer_id);
    }

    /// Drops every staging buffer.
    pub fn clear(&mut self) {
        self.staging.clear();
    }

    /// Drops transfers idle past the timeout and, if `incoming` would be a
    /// new transfer over the cap, the least recently active one.
    fn evict(&mut self, incoming: &TransferId, now: Instant) {
        let idle_timeout = self.config.transfer_idle_timeout;
        let before = self.staging.len();
        self.staging
            .retain(|_, staging| now.saturating_duration_since(staging.last_seen) <= idle_timeout);
        let idle = before - self.staging.len();
        if idle > 0 {
            tracing::debug!(dropped = idle, "dropped idle partial transfers");
        }

        if self.staging.contains_key(incoming)
            || self.staging.len() < self.config.max_pending_transfers.max(1)
        {
            return;
        }
        let oldest = self
            .staging
            .iter()
            .min_by_key(|(_, staging)| staging.last_seen)
            .map(|(id, _)| *id);
        if let Some(oldest) = oldest {
            self.staging.remove(&oldest);
            tracing::warn!(
                transfer_id = %oldest,
                limit = self.config.max_pending_transfers,
                "too many partial transfers, dropping the oldest"
            );
        }
    }

    fn stage(&mut self, split: SplitChunk) -> Result<Reassembled, CodecError> {
        let transfer_id = split.transfer_id;
        if split.total_chunks == 0 {
            return Err(CodecError::EmptyTransfer(transfer_id));
        }
        if split.sequence_index >= split.total_chunks {
            return Err(CodecError::IndexOutOfRange {
                transfer_id,
                index: split.sequence_index,
                total: split.total_chunks,
            });
        }
        let limit = self.config.max_message_size as u64;
        if split.total_size > limit {
            return Err(CodecError::TooLarge {
                size: split.total_size,
                limit,
            });
        }

        let staging = self.staging.entry(transfer_id).or_insert_with(|| Staging {
            total_chunks: split.total_chunks,
            total_size: split.total_size,
            chunks: BTreeMap::new(),
            received: 0,
            last_seen: Instant::now(),
        });
        if staging.total_chunks != split.total_chunks || staging.total_size != split.total_size
        {
            return Err(CodecError::TransferMismatch(transfer_id));
        }

        staging.last_seen = Instant::now();
        let len = split.chunk.len() as u64;
        if let Some(previous) = staging.chunks.insert(split.sequence_index, split.chunk) {
            staging.received = staging.received.saturating_sub(previous.len() as u64);
        }
        staging.received = staging.received.saturating_add(len);
        if staging.received > staging.total_size {
            return Err(CodecError::SizeMismatch {
                transfer_id,
                expected: staging.total_size,
                actual: staging.received,
            });
        }

        let progress = ProgressState {
            uuid: transfer_id,
            total_size: staging.total_size,
            completed_size: staging.received,
        };

        if staging.chunks.len() < staging.total_chunks as usize {
            return Ok(Reassembled::Progress(progress));
        }

        let Some(staging) = self.staging.remove(&transfer_id) else {
            return Ok(Reassembled::Progress(progress));
        };
        if staging.received != staging.total_size {
            return Err(CodecError::SizeMismatch {
                transfer_id,
                expected: staging.total_size,
                actual: staging.received,
            });
        }
        let mut payload = Vec::with_capacity(staging.received as usize);
        for chunk in staging.chunks.into_values() {
            payload.extend_from_slice(&chunk);
        }
        Ok(Reassembled::Complete {
            payload,
            progress: Some(progress),
        })
    }
}
