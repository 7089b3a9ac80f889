//! The shared, timestamped key/value store every node reads from and writes to.
//!
//! Every write of a key `K` also writes `K__timestamp`; a batch write stamps all
//! of its keys with one timestamp. Reads never fail for a missing key, they
//! return the caller's default instead.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

pub mod client;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::ContextClient;
pub use server::ContextServer;
pub use store::ContextStore;

pub const TIMESTAMP_SUFFIX: &str = "__timestamp";

/// `cam/image-jpeg` → `cam/image-jpeg__timestamp`
pub fn timestamp_key(key: &str) -> String {
    format!("{key}{TIMESTAMP_SUFFIX}")
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("batch write has {keys} keys but {values} values")]
    BatchArity { keys: usize, values: usize },
    #[error("context transport failed: {0}")]
    Transport(String),
    #[error("context service rejected the shared secret")]
    Unauthorized,
    #[error("context service error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed context reply: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait Context: Send + Sync {
    /// Values aligned with `keys`; missing keys come back as `default`.
    async fn get_many(&self, keys: &[String], default: Value) -> Result<Vec<Value>, ContextError>;

    /// Write all pairs as one logical update and return the timestamp they share.
    async fn put_many(&self, keys: Vec<String>, values: Vec<Value>) -> Result<f64, ContextError>;

    /// Every key currently stored, companion timestamp keys included.
    async fn keys(&self) -> Result<Vec<String>, ContextError>;

    /// Short description used in logs.
    fn name(&self) -> String;

    async fn get(&self, key: &str) -> Result<Value, ContextError> {
        self.get_or(key, Value::Null).await
    }

    async fn get_or(&self, key: &str, default: Value) -> Result<Value, ContextError> {
        let mut values = self.get_many(&[key.to_owned()], default).await?;
        values
            .pop()
            .ok_or_else(|| ContextError::Protocol("empty reply to single get".into()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<f64, ContextError> {
        self.put_many(vec![key.to_owned()], vec![value]).await
    }

    async fn put_map(&self, mapping: HashMap<String, Value>) -> Result<f64, ContextError> {
        let (keys, values) = mapping.into_iter().unzip();
        self.put_many(keys, values).await
    }

    /// Timestamp of the last write to `key`, if it was ever written.
    async fn timestamp(&self, key: &str) -> Result<Option<f64>, ContextError> {
        Ok(self.get(&timestamp_key(key)).await?.as_f64())
    }
}
