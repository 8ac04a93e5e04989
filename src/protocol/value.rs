//! Binary payloads inside JSON values.
//!
//! Byte buffers are carried as a tagged object so they survive the JSON
//! encoding bit-for-bit:
//!
//! ```json
//! {"__type__": "Buffer", "data": "aGVsbG8="}
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

const TYPE_KEY: &str = "__type__";
const BUFFER_TYPE: &str = "Buffer";

/// Wraps raw bytes into a tagged JSON value.
#[must_use]
pub fn bytes_to_value(bytes: &[u8]) -> Value {
    json!({ "__type__": BUFFER_TYPE, "data": STANDARD.encode(bytes) })
}

/// Extracts raw bytes from a value produced by [`bytes_to_value`].
///
/// Returns `None` when the value is not a tagged buffer or its data is not
/// valid base64.
#[must_use]
pub fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    if !is_buffer(value) {
        return None;
    }
    let data = value.get("data")?.as_str()?;
    STANDARD.decode(data).ok()
}

/// Returns `true` if the value is a tagged buffer.
#[must_use]
pub fn is_buffer(value: &Value) -> bool {
    value.get(TYPE_KEY).and_then(Value::as_str) == Some(BUFFER_TYPE)
}
