//! Per-connection request context.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::protocol::Encoded;

/// Queue of encoded messages waiting to be written to one connection.
pub type OutboundSender = mpsc::Sender<Encoded>;

/// Unique identifier for one server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Creates a new random `ConnectionId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a handler knows about the caller.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Connection the request arrived on.
    pub connection_id: ConnectionId,
    /// Peer address, when the transport has one.
    pub remote_addr: Option<SocketAddr>,
    pub(crate) outbound: OutboundSender,
}

impl RequestContext {
    /// Creates a context for a connection whose outbound queue is
    /// `outbound`.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            connection_id,
            remote_addr,
            outbound,
        }
    }
}
