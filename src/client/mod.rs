//! RPC client: connection state machine, request correlation, and event
//! listeners.

pub mod connection;
pub mod listeners;
pub mod pending;
pub mod reconnect;
pub mod service_client;

pub use connection::{Connection, ConnectionState, InboundFrame, LifecycleEvent};
pub use listeners::{ClientListeners, EventCallback, StaleSubscription};
pub use pending::{PendingCall, PendingCalls};
pub use reconnect::{Backoff, OfflineSendPolicy, ReconnectPolicy};
pub use service_client::{CallOptions, ServiceClient};
