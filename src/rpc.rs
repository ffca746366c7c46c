//! JSON-RPC frame model for the stdio transport
//!
//! The bridge never interprets method names or payloads. It only needs the
//! `id` field as an opaque correlation token, and that token's wire type
//! (string vs. number) must survive the round trip unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// The JSON-RPC `id` field, preserved with its original wire type.
///
/// Never compared or interpreted numerically; it is only a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    Text(String),
}

impl RequestId {
    pub fn from_u64(value: u64) -> Self {
        Self::Number(Number::from(value))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(number) => Value::Number(number.clone()),
            Self::Text(text) => Value::String(text.clone()),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => write!(f, "{text}"),
        }
    }
}

/// One line on the child's stdio, classified by shape.
///
/// A frame with a `method` is a request (or a notification when `id` is
/// absent); anything else carrying an `id` is treated as a response. The
/// variant order matters for untagged deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request {
        #[serde(skip_serializing_if = "Option::is_none")]
        jsonrpc: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        jsonrpc: Option<String>,
        id: RequestId,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl Frame {
    pub fn correlation_id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } => id.as_ref(),
            Self::Response { id, .. } => Some(id),
        }
    }
}

/// Synthesized reply pushed to a session when its pending entry expires.
pub fn timeout_error_frame(id: &RequestId) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.to_value(),
        "error": {
            "code": -32000,
            "message": "request timed out waiting for subprocess reply"
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_id_survives_round_trip() {
        let id: RequestId = serde_json::from_str("42").expect("numeric id");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "42");
    }

    #[test]
    fn string_id_is_not_coerced() {
        let id: RequestId = serde_json::from_str("\"42\"").expect("string id");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"42\"");

        let numeric: RequestId = serde_json::from_str("42").expect("numeric id");
        assert_ne!(id, numeric);
    }

    #[test]
    fn request_frame_parses_with_method() {
        let frame: Frame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{"a":1}}"#,
        )
        .expect("request frame");

        assert!(matches!(frame, Frame::Request { .. }));
        assert_eq!(
            frame.correlation_id(),
            Some(&RequestId::from_u64(1))
        );
    }

    #[test]
    fn response_frame_parses_without_method() {
        let frame: Frame = serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","result":"pong"}"#)
            .expect("response frame");

        assert!(matches!(frame, Frame::Response { .. }));
        assert_eq!(
            frame.correlation_id(),
            Some(&RequestId::Text("abc".to_string()))
        );
    }

    #[test]
    fn notification_has_no_correlation_id() {
        let frame: Frame = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notify"}"#)
            .expect("notification frame");

        assert!(frame.correlation_id().is_none());
    }

    #[test]
    fn frame_without_id_or_method_is_rejected() {
        let parsed = serde_json::from_str::<Frame>(r#"{"jsonrpc":"2.0"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn timeout_frame_carries_original_id_type() {
        let text = timeout_error_frame(&RequestId::Text("req-7".to_string()));
        let value: Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(value["id"], "req-7");
        assert_eq!(value["error"]["code"], -32000);
    }
}
