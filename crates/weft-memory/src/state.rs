use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use weft_core::error::{Result, WeftError};
use weft_core::traits::StateStore;

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// Process-local state store with per-key TTL.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Live keys, sorted. Mostly for diagnostics and tests.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.lock();
            match entries.get(&key) {
                Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
                Some(_) => {
                    entries.remove(&key);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            // A TTL past the clock's range never expires.
            let expires_at = ttl.and_then(|d| Instant::now().checked_add(d));
            self.lock().insert(key, Entry { value, expires_at });
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = Instant::now();
            Ok(self.lock().remove(&key).is_some_and(|e| e.is_live(now)))
        })
    }

    fn exists(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = Instant::now();
            Ok(self.lock().get(&key).is_some_and(|e| e.is_live(now)))
        })
    }

    fn increment(&self, key: &str, by: i64) -> BoxFuture<'_, Result<i64>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.lock();
            let (current, expires_at) = match entries.get(&key) {
                Some(e) if e.is_live(now) => {
                    let n = e.value.as_i64().ok_or_else(|| {
                        WeftError::StateStore(format!("value at {} is not an integer", key))
                    })?;
                    (n, e.expires_at)
                }
                _ => (0, None),
            };
            let next = current + by;
            entries.insert(
                key,
                Entry {
                    value: serde_json::Value::from(next),
                    expires_at,
                },
            );
            Ok(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_delete() {
        let store = InMemoryStateStore::new();
        store.set("a", json!({"x": 1}), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert!(store.exists("a").await.unwrap());
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires() {
        let store = InMemoryStateStore::new();
        store
            .set("k", json!("v"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.exists("k").await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn unrepresentable_ttl_never_expires() {
        let store = InMemoryStateStore::new();
        store
            .set("forever", json!(1), Some(Duration::MAX))
            .await
            .unwrap();
        store
            .set("long", json!(2), Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap();
        assert_eq!(store.get("forever").await.unwrap(), Some(json!(1)));
        assert!(store.exists("long").await.unwrap());
    }

    #[tokio::test]
    async fn increment_counts() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.increment("n", 1).await.unwrap(), 1);
        assert_eq!(store.increment("n", 5).await.unwrap(), 6);
        store.set("s", json!("text"), None).await.unwrap();
        assert!(store.increment("s", 1).await.is_err());
    }
}
