//! Logical protocol messages.
//!
//! [`Message`] is the tagged union exchanged between client and server.
//! It serializes to JSON with a `type` discriminator:
//!
//! ```json
//! {"type":"request","id":1,"command":"user.get","params":[42]}
//! {"type":"response","requestId":1,"body":{"name":"ada"}}
//! {"type":"error","requestId":1,"message":"...","stack":"...","code":"HANDLER_ERROR"}
//! {"type":"event","listenerId":3,"data":{"changed":true}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire code used when an error response does not carry one.
pub const DEFAULT_ERROR_CODE: &str = "HANDLER_ERROR";

/// A logical protocol unit before chunking or after reassembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Caller → responder command invocation.
    Request(Request),
    /// Successful reply to a [`Request`].
    Response(Response),
    /// Failed reply to a [`Request`].
    Error(ErrorResponse),
    /// Server → client push for a registered listener.
    Event(EventPush),
}

impl Message {
    /// Returns the request id this message replies to, if it is a reply.
    #[must_use]
    pub const fn reply_id(&self) -> Option<u32> {
        match self {
            Self::Response(res) => Some(res.request_id),
            Self::Error(err) => Some(err.request_id),
            Self::Request(_) | Self::Event(_) => None,
        }
    }

    /// Short name of the variant, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
            Self::Event(_) => "event",
        }
    }
}

/// Command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-allocated id, unique per connection.
    pub id: u32,
    /// Registered command name.
    pub command: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    #[serde(rename = "requestId")]
    pub request_id: u32,
    /// Handler result.
    #[serde(default)]
    pub body: Value,
}

/// Failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Id of the request being answered.
    #[serde(rename = "requestId")]
    pub request_id: u32,
    /// Human-readable failure message.
    pub message: String,
    /// Cause chain of the failure on the responding side.
    #[serde(default)]
    pub stack: String,
    /// Machine-readable failure kind.
    #[serde(default = "default_error_code")]
    pub code: String,
}

/// Event delivered to one listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPush {
    /// Listener the event is addressed to.
    #[serde(rename = "listenerId")]
    pub listener_id: u32,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

fn default_error_code() -> String {
    DEFAULT_ERROR_CODE.to_string()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_wire_field_names() {
        let msg = Message::Request(Request {
            id: 1,
            command: "echo".to_string(),
            params: vec![json!("hi")],
        });
        let Ok(value) = serde_json::to_value(&msg) else {
            panic!("serialization failed");
        };
        assert_eq!(
            value,
            json!({"type": "request", "id": 1, "command": "echo", "params": ["hi"]})
        );
    }

    #[test]
    fn reply_fields_are_camel_case() {
        let msg = Message::Response(Response {
            request_id: 9,
            body: json!(true),
        });
        let Ok(value) = serde_json::to_value(&msg) else {
            panic!("serialization failed");
        };
        assert_eq!(value.get("requestId"), Some(&json!(9)));
        assert_eq!(value.get("type"), Some(&json!("response")));
    }

    #[test]
    fn error_without_code_gets_default() {
        let raw = r#"{"type":"error","requestId":3,"message":"boom"}"#;
        let Ok(Message::Error(err)) = serde_json::from_str::<Message>(raw) else {
            panic!("expected error message");
        };
        assert_eq!(err.code, DEFAULT_ERROR_CODE);
        assert!(err.stack.is_empty());
    }

    #[test]
    fn event_parses_listener_id() {
        let raw = r#"{"type":"event","listenerId":5,"data":[1,2]}"#;
        let Ok(Message::Event(evt)) = serde_json::from_str::<Message>(raw) else {
            panic!("expected event message");
        };
        assert_eq!(evt.listener_id, 5);
        assert_eq!(evt.data, json!([1, 2]));
    }

    #[test]
    fn reply_id_only_for_replies() {
        let req = Message::Request(Request {
            id: 4,
            command: "x".to_string(),
            params: Vec::new(),
        });
        assert_eq!(req.reply_id(), None);
        let res = Message::Response(Response {
            request_id: 4,
            body: Value::Null,
        });
        assert_eq!(res.reply_id(), Some(4));
    }
}
