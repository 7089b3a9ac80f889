use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON‑RPC 2.0 core types shared by the unit control plane (stdin/stdout of a
/// unit process) and the context service (TCP).
///
/// They are **transport‑agnostic**: one message per line, UTF‑8 JSON.
///
/// ```ignore
/// use serde_json::json;
/// use unit_plugin::jsonrpc::{Id, Request};
///
/// let req = Request::call(Id::Number(1), "get", Some(json!({"key": "cam/image-jpeg"})));
/// let s = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const APPLICATION_ERROR: i64 = -32000;
pub const UNAUTHORIZED: i64 = -32001;

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("json-rpc error {code}: {message}")]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Convenience enum so callers can `serde_json::from_str::<Message>()` without inspecting the type first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

impl Response {
    /// Convenience helper for a successful result.
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Convenience helper for an error result.
    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(Error {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    /// Collapse the response into the `result` payload, or the error object.
    /// A response carrying neither is read as `null`.
    pub fn into_result(self) -> Result<Value, Error> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(v), None) => Ok(v),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Serialise any message as one protocol line (trailing `\n` included).
pub fn encode_line<T: Serialize>(msg: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}
