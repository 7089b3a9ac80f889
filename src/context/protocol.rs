//! Wire shapes of the context service. One JSON-RPC 2.0 message per line over TCP.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
pub enum ContextMethod {
    /// Must be the first call on every connection.
    Hello,
    Get,
    GetMany,
    Put,
    PutMany,
    Keys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub secret: String,
    #[serde(default)]
    pub client: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub vehicle_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParams {
    pub key: String,
    #[serde(default)]
    pub default: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetManyParams {
    pub keys: Vec<String>,
    #[serde(default)]
    pub default: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutParams {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutManyParams {
    pub keys: Vec<String>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResult {
    pub timestamp: f64,
}
