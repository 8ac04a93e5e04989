//! Error types for the codec, transports, and RPC calls.
//!
//! [`ServiceError`] is the central error type a caller sees. Each variant
//! maps to a stable wire code carried in the `code` field of an
//! [`ErrorResponse`], so the requesting side can rebuild the error kind.
//!
//! # Wire Codes
//!
//! | Code                | Raised by          | Connection survives |
//! |---------------------|--------------------|---------------------|
//! | `COMMAND_NOT_FOUND` | server dispatcher  | yes                 |
//! | `UNAUTHORIZED`      | server dispatcher  | yes                 |
//! | `HANDLER_ERROR`     | command handler    | yes                 |
//! | `INVALID_PARAMS`    | built-in commands  | yes                 |
//! | `TIMEOUT`           | client / handler   | yes                 |
//! | `CODEC_ERROR`       | codec              | yes                 |
//! | `CONNECTION_LOST`   | connection         | no                  |
//! | `CLOSED`            | connection         | no                  |

use crate::protocol::message::{DEFAULT_ERROR_CODE, ErrorResponse};
use crate::protocol::TransferId;

/// Malformed or inconsistent frame. The affected message is dropped; the
/// connection is unaffected.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Buffer shorter than the frame header.
    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum length required.
        expected: usize,
        /// Length received.
        actual: usize,
    },

    /// Unrecognised frame kind byte.
    #[error("unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// Split frame announcing zero chunks.
    #[error("transfer {0} announces zero chunks")]
    EmptyTransfer(TransferId),

    /// Sequence index outside `0..total_chunks`.
    #[error("transfer {transfer_id}: chunk index {index} out of range (total {total})")]
    IndexOutOfRange {
        /// Offending transfer.
        transfer_id: TransferId,
        /// Index received.
        index: u32,
        /// Announced chunk count.
        total: u32,
    },

    /// A transfer id was reused with a different chunk count or size.
    #[error("transfer {0} reused with mismatched header")]
    TransferMismatch(TransferId),

    /// Reassembled bytes differ from the announced size.
    #[error("transfer {transfer_id}: reassembled {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Offending transfer.
        transfer_id: TransferId,
        /// Announced size.
        expected: u64,
        /// Actual size.
        actual: u64,
    },

    /// Message exceeds the configured maximum size.
    #[error("message size {size} exceeds the limit of {limit} bytes")]
    TooLarge {
        /// Encoded or announced size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// Payload is not a valid message.
    #[error("invalid message payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Transfer the error belongs to, when it is known.
    #[must_use]
    pub const fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Self::EmptyTransfer(id) | Self::TransferMismatch(id) => Some(*id),
            Self::IndexOutOfRange { transfer_id, .. } | Self::SizeMismatch { transfer_id, .. } => {
                Some(*transfer_id)
            }
            Self::Truncated { .. } | Self::UnknownFrameKind(_) | Self::TooLarge { .. } | Self::Json(_) => {
                None
            }
        }
    }
}

/// Failure of the underlying duplex transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Read or write failure on an open transport.
    #[error("transport i/o error: {0}")]
    Io(String),

    /// The peer closed the transport.
    #[error("transport closed")]
    Closed,
}

/// Failure of an RPC call, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The call did not complete before its deadline.
    #[error("request '{command}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Command that timed out.
        command: String,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The connection dropped or exhausted its reconnect attempts.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection was closed explicitly.
    #[error("connection closed")]
    Closed,

    /// The connection is not connected and offline sends are rejected.
    #[error("not connected")]
    NotConnected,

    /// The offline send queue is full.
    #[error("send queue full ({capacity} waiting)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The caller lacks a permission the command requires.
    #[error("unauthorized: {0}")]
    Authorization(String),

    /// No handler is registered under the command name.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// Parameters of a built-in command were malformed.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The command handler failed.
    #[error("{message}")]
    Handler {
        /// Failure message.
        message: String,
        /// Cause chain on the responding side.
        stack: String,
    },

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the wire code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Codec(_) => "CODEC_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::Closed => "CLOSED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::Authorization(_) => "UNAUTHORIZED",
            Self::CommandNotFound(_) => "COMMAND_NOT_FOUND",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::Handler { .. } => DEFAULT_ERROR_CODE,
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns `true` for errors after which the connection is unusable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Closed)
    }

    /// Builds the error reply sent back for `request_id`.
    #[must_use]
    pub fn to_error_response(&self, request_id: u32) -> ErrorResponse {
        let stack = match self {
            Self::Handler { stack, .. } => stack.clone(),
            other => format!("{other:?}"),
        };
        ErrorResponse {
            request_id,
            message: self.to_string(),
            stack,
            code: self.error_code().to_string(),
        }
    }

    /// Rebuilds the caller-side error from an error reply.
    #[must_use]
    pub fn from_error_response(command: &str, response: ErrorResponse) -> Self {
        match response.code.as_str() {
            "COMMAND_NOT_FOUND" => Self::CommandNotFound(command.to_string()),
            "UNAUTHORIZED" => Self::Authorization(
                response
                    .message
                    .strip_prefix("unauthorized: ")
                    .unwrap_or(&response.message)
                    .to_string(),
            ),
            "INVALID_PARAMS" => Self::InvalidParams(
                response
                    .message
                    .strip_prefix("invalid params: ")
                    .unwrap_or(&response.message)
                    .to_string(),
            ),
            "TIMEOUT" => Self::Timeout {
                command: command.to_string(),
                timeout_ms: timeout_ms_from_message(&response.message).unwrap_or(0),
            },
            _ => Self::Handler {
                message: response.message,
                stack: response.stack,
            },
        }
    }
}

/// Extracts `N` from a "... timed out after N ms" message.
fn timeout_ms_from_message(message: &str) -> Option<u64> {
    let (_, rest) = message.rsplit_once("timed out after ")?;
    rest.strip_suffix(" ms")?.trim().parse().ok()
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `LISTEN_ADDR` is not a valid socket address.
    #[error("invalid listen address '{value}': {source}")]
    InvalidListenAddr {
        /// Raw value.
        value: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },

    /// Codec limits are inconsistent.
    #[error("invalid codec configuration: {0}")]
    InvalidCodec(String),
}
