//! Server side: command registry, dispatcher, event bus, and sessions.
//!
//! A [`ServerDispatcher`] is built once from a [`CommandRegistry`] and
//! shared by every connection. Each transport is served by
//! [`run_session`], whether it came from the axum WebSocket route or an
//! in-memory [`MemoryListener`](crate::transport::MemoryListener).

pub mod context;
pub mod dispatcher;
pub mod event_bus;
pub mod registry;
pub mod session;
pub mod upload;

pub use context::{ConnectionId, RequestContext};
pub use dispatcher::{Authorizer, ServerDispatcher};
pub use event_bus::{EventBus, ListenerEntry};
pub use registry::{CommandDescriptor, CommandHandler, CommandRegistry};
pub use session::{run_session, serve_listener};
pub use upload::UploadStore;
