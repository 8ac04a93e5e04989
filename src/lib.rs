//! # duplex-rpc
//!
//! Bidirectional RPC and event protocol over a single persistent socket.
//!
//! A client issues numbered requests and awaits their responses while the
//! server pushes events to listeners the client registered. Large messages
//! are split into fixed-size chunks with per-transfer progress, and the
//! client reconnects on its own according to a [`client::ReconnectPolicy`].
//!
//! ## Architecture
//!
//! ```text
//! ServiceClient (client/)
//!     │  PendingCalls, ClientListeners
//!     ├── Connection: state machine + reconnect loop
//!     │
//!     ├── Codec (protocol/): frames, split/reassembly, progress
//!     │
//!     ├── Transport (transport/): WebSocket | in-memory
//!     │
//! Axum router (api/, ws/)      MemoryListener
//!     │                            │
//!     └──── run_session (server/) ─┘
//!             ├── ServerDispatcher: built-ins, registry, authorizer
//!             └── EventBus: listener table, event push
//! ```

pub mod api;
pub mod app_state;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod ws;

pub use client::ServiceClient;
pub use config::{ClientConfig, CodecConfig, ServerConfig};
pub use error::ServiceError;
pub use server::{CommandRegistry, ServerDispatcher};
