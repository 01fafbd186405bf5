use capa_shared::error::CommonError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `initialize` / `notifications/initialized` / `tools/list` / `tools/call` plus
/// whatever else a client sends — anything outside that set is `-32601`.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
}

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
pub const PARSE_ERROR: i64 = -32700;

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcErrorBody {
                    code,
                    message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::error(Value::Null, PARSE_ERROR, message.into())
    }
}

/// Maps a [`CommonError`] onto the router's `-32603` taxonomy: every internal
/// failure surfaces as `Internal error` with the original message attached — `-32601`
/// is reserved for the router's own unknown-method branch and never produced here.
pub fn to_jsonrpc_error(id: Value, error: &CommonError) -> JsonRpcResponse {
    JsonRpcResponse::error(id, INTERNAL_ERROR, error.to_string())
}

/// Wraps a tool-call result as the MCP `content[0].text` envelope ("small
/// hand-written decoder"): used for command-type tools and the on-demand meta-tools,
/// whose results are synthesized locally rather than passed through from upstream.
pub fn text_content(value: &Value) -> Value {
    serde_json::json!({
            "content": [{ "type": "text", "text": serde_json::to_string(value).unwrap_or_default() }]
    })
}
