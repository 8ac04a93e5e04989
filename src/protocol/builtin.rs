//! Command names and payloads of the commands every server answers
//! without a registered handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `[eventName, info] -> listenerId`
pub const ADD_EVENT_LISTENER: &str = "addEventListener";

/// `[listenerId] -> null`
pub const REMOVE_EVENT_LISTENER: &str = "removeEventListener";

/// `[eventName] -> [{id, info}]`
pub const GET_EVENT_LISTENERS: &str = "getEventListeners";

/// `[[listenerIds], data] -> null`
pub const EMIT_EVENT: &str = "emitEvent";

/// `[filename, buffer] -> {path, filename, size}`
pub const UPLOAD: &str = "upload";

/// Returns `true` if `command` is answered by the server itself.
#[must_use]
pub fn is_builtin(command: &str) -> bool {
    matches!(
        command,
        ADD_EVENT_LISTENER | REMOVE_EVENT_LISTENER | GET_EVENT_LISTENERS | EMIT_EVENT | UPLOAD
    )
}

/// One entry of a `getEventListeners` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerInfo {
    /// Listener id.
    pub id: u32,
    /// Filter metadata the subscriber registered with.
    #[serde(default)]
    pub info: Value,
}

/// Reply to an `upload` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    /// Server-side path the file was written to.
    pub path: String,
    /// Stored file name.
    pub filename: String,
    /// Number of bytes written.
    pub size: u64,
}
