//! Protocol layer: messages, frames, codec, and progress tracking.
//!
//! Everything in this module is pure: no sockets, no tasks. The client
//! and server layers drive it from their read and write loops.

pub mod builtin;
pub mod codec;
pub mod frame;
pub mod message;
pub mod progress;
pub mod transfer_id;
pub mod value;

pub use builtin::{ListenerInfo, UploadResult};
pub use codec::{
    Decoded, Decoder, Encoded, Reassembled, decode_message, decode_offloaded, encode, encode_payload,
};
pub use frame::{Frame, SplitChunk};
pub use message::{ErrorResponse, EventPush, Message, Request, Response};
pub use progress::{Direction, ProgressObserver, ProgressState, ProgressTracker};
pub use transfer_id::TransferId;
