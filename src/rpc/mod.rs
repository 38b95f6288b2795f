//! JSON-RPC 2.0 plumbing for the agent-facing transport.
//!
//! One JSON object per line on stdin/stdout. Requests carry `id`, `method`
//! and optional `params`; notifications omit `id` and get no reply.

pub mod dispatcher;
pub mod server;
pub mod tools;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Inbound JSON-RPC request envelope.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Outbound reply envelope: exactly one of `result` / `error` is present.
/// The result is kept as raw JSON so pre-rendered documents (tool schemas)
/// are spliced without a round-trip through a JSON model.
#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        let raw = serde_json::value::to_raw_value(&result)
            .expect("result serialization is infallible");
        Self::success_raw(id, raw)
    }

    pub fn success_raw(id: Value, result: Box<RawValue>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("response serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_decodes_with_and_without_params() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert_eq!(req.method, "tools/list");
        assert!(req.params.is_null());
        assert!(!req.is_notification());

        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn response_has_exactly_one_of_result_or_error() {
        let ok = Response::success(Value::from(1), serde_json::json!({"x": 1})).to_line();
        assert!(ok.contains("\"result\""));
        assert!(!ok.contains("\"error\""));

        let err = Response::failure(Value::from(2), METHOD_NOT_FOUND, "no such method").to_line();
        assert!(err.contains("\"error\""));
        assert!(err.contains("-32601"));
        assert!(!err.contains("\"result\""));
    }
}
