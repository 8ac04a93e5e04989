//! Type-safe transfer identifier.
//!
//! [`TransferId`] is a newtype wrapper around [`uuid::Uuid`] naming one
//! logical message's journey across the wire. Split frames carry it so the
//! receiver can stage chunks of concurrent transfers separately.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for one transfer (a message and all of its frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(uuid::Uuid);

impl TransferId {
    /// Creates a new random `TransferId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Deterministic transfer id used for the reply to `request_id`.
    ///
    /// Lets the requesting side attribute split-response progress to the
    /// pending call before the response has been fully reassembled. Random
    /// v4 ids always carry version bits, so they never collide with these.
    #[must_use]
    pub const fn reply_to(request_id: u32) -> Self {
        Self(uuid::Uuid::from_u64_pair(0, request_id as u64))
    }

    /// Returns the request id this transfer replies to, if it was created
    /// with [`TransferId::reply_to`].
    #[must_use]
    pub fn replied_request(&self) -> Option<u32> {
        let (high, low) = self.0.as_u64_pair();
        if high != 0 {
            return None;
        }
        u32::try_from(low).ok()
    }

    /// Creates a `TransferId` from raw big-endian bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Returns the raw big-endian bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for TransferId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn new_generates_unique_ids() {
        assert_ne!(TransferId::new(), TransferId::new());
    }

    #[test]
    fn reply_to_is_deterministic() {
        assert_eq!(TransferId::reply_to(7), TransferId::reply_to(7));
        assert_ne!(TransferId::reply_to(7), TransferId::reply_to(8));
    }

    #[test]
    fn replied_request_recovers_id() {
        assert_eq!(TransferId::reply_to(42).replied_request(), Some(42));
        assert_eq!(TransferId::new().replied_request(), None);
    }

    #[test]
    fn bytes_round_trip() {
        let id = TransferId::new();
        assert_eq!(TransferId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn display_is_uuid_format() {
        let s = TransferId::new().to_string();
        assert_eq!(s.len(), 36);
        assert!(s.contains('-'));
    }
}
