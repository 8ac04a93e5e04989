//! WebSocket layer: the `/ws` upgrade route and socket adaptation.
//!
//! Each upgraded socket becomes a frame transport served by
//! [`run_session`](crate::server::run_session), with ping/pong liveness
//! checks layered on top.

pub mod connection;
pub mod handler;
pub mod heartbeat;
