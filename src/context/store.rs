use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use super::{Context, ContextError, timestamp_key};

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, Value>,
    last_stamp: f64,
}

/// The authoritative in-memory context. One lock guards both the values and the
/// clock, so a batch and its timestamp become visible together.
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    inner: Arc<Mutex<Entries>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `vehicle_name`.
    pub fn seeded(vehicle_name: &str) -> Self {
        let store = Self::new();
        store.write(vec!["vehicle_name".into()], vec![json!(vehicle_name)]).ok();
        store
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // a panic while holding the lock leaves the map intact, keep serving it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read(&self, keys: &[String], default: &Value) -> Vec<Value> {
        let entries = self.lock();
        keys.iter()
            .map(|k| entries.values.get(k).cloned().unwrap_or_else(|| default.clone()))
            .collect()
    }

    /// Apply one batch under a single timestamp. Nothing is written when the
    /// lengths disagree.
    pub fn write(&self, keys: Vec<String>, values: Vec<Value>) -> Result<f64, ContextError> {
        if keys.len() != values.len() {
            return Err(ContextError::BatchArity { keys: keys.len(), values: values.len() });
        }
        let mut entries = self.lock();
        let stamp = next_stamp(entries.last_stamp);
        entries.last_stamp = stamp;
        for (key, value) in keys.into_iter().zip(values) {
            entries.values.insert(timestamp_key(&key), json!(stamp));
            entries.values.insert(key, value);
        }
        Ok(stamp)
    }

    pub fn key_list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().values.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Wall-clock seconds, nudged forward when the clock has not advanced past the previous stamp.
fn next_stamp(last: f64) -> f64 {
    let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
    if now > last { now } else { last + 1e-6 }
}

#[async_trait]
impl Context for ContextStore {
    async fn get_many(&self, keys: &[String], default: Value) -> Result<Vec<Value>, ContextError> {
        Ok(self.read(keys, &default))
    }

    async fn put_many(&self, keys: Vec<String>, values: Vec<Value>) -> Result<f64, ContextError> {
        self.write(keys, values)
    }

    async fn keys(&self) -> Result<Vec<String>, ContextError> {
        Ok(self.key_list())
    }

    fn name(&self) -> String {
        "local".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let ctx = ContextStore::new();
        ctx.put("user/throttle", json!(0.5)).await.unwrap();
        assert_eq!(ctx.get("user/throttle").await.unwrap(), json!(0.5));
    }

    #[tokio::test]
    async fn missing_key_yields_default() {
        let ctx = ContextStore::new();
        assert_eq!(ctx.get("nope").await.unwrap(), Value::Null);
        let got = ctx
            .get_many(&["a".into(), "b".into()], json!(-1))
            .await
            .unwrap();
        assert_eq!(got, vec![json!(-1), json!(-1)]);
        assert_eq!(ctx.timestamp("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let ctx = ContextStore::new();
        let mut last = 0.0;
        for i in 0..200 {
            let ts = ctx.put("k", json!(i)).await.unwrap();
            assert!(ts > last);
            assert_eq!(ctx.timestamp("k").await.unwrap(), Some(ts));
            last = ts;
        }
    }

    #[tokio::test]
    async fn batch_shares_one_timestamp() {
        let ctx = ContextStore::new();
        let ts = ctx
            .put_many(vec!["a".into(), "b".into()], vec![json!(1), json!(2)])
            .await
            .unwrap();
        assert_eq!(ctx.timestamp("a").await.unwrap(), Some(ts));
        assert_eq!(ctx.timestamp("b").await.unwrap(), Some(ts));
    }

    #[tokio::test]
    async fn mismatched_batch_writes_nothing() {
        let ctx = ContextStore::new();
        let err = ctx
            .put_many(vec!["a".into(), "b".into()], vec![json!(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::BatchArity { keys: 2, values: 1 }));
        assert!(ctx.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_map_and_seed() {
        let ctx = ContextStore::seeded("NoahCar");
        assert_eq!(ctx.get("vehicle_name").await.unwrap(), json!("NoahCar"));
        let mut m = HashMap::new();
        m.insert("x".to_string(), json!(true));
        m.insert("y".to_string(), json!("on"));
        let ts = ctx.put_map(m).await.unwrap();
        assert_eq!(ctx.timestamp("y").await.unwrap(), Some(ts));
        assert!(ctx.keys().await.unwrap().contains(&"x__timestamp".to_string()));
    }
}
