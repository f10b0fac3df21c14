use crate::store::{check_etag, StateStore, StoreEntry};
use async_trait::async_trait;
use maestro_core::MaestroResult;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process store. Everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> MaestroResult<Option<StoreEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_etag: Option<u64>,
    ) -> MaestroResult<u64> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map(|e| e.etag);
        check_etag(key, current, expected_etag)?;
        let etag = current.unwrap_or(0) + 1;
        entries.insert(key.to_string(), StoreEntry { etag, value });
        Ok(etag)
    }

    async fn delete(&self, key: &str) -> MaestroResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> MaestroResult<Vec<String>> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::update_json;
    use maestro_core::{MaestroError, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_get_and_etag_progression() {
        let store = MemoryStateStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        let e1 = store.put("a", json!(1), None).await.unwrap();
        let e2 = store.put("a", json!(2), Some(e1)).await.unwrap();
        assert_eq!((e1, e2), (1, 2));

        let entry = store.get("a").await.unwrap().unwrap();
        assert_eq!(entry.value, json!(2));
        assert_eq!(entry.etag, 2);
    }

    #[tokio::test]
    async fn test_stale_etag_conflicts() {
        let store = MemoryStateStore::new();
        store.put("k", json!("x"), None).await.unwrap();
        store.put("k", json!("y"), None).await.unwrap();

        let err = store.put("k", json!("z"), Some(1)).await.unwrap_err();
        assert!(matches!(err, MaestroError::Conflict { .. }));

        let err = store.put("k", json!("z"), Some(0)).await.unwrap_err();
        assert_eq!(err.code(), "ConflictError");
    }

    #[tokio::test]
    async fn test_keys_by_prefix_sorted() {
        let store = MemoryStateStore::new();
        store.put("workflow/b/state", json!({}), None).await.unwrap();
        store.put("workflow/a/state", json!({}), None).await.unwrap();
        store.put("registry/agents", json!({}), None).await.unwrap();

        let keys = store.keys("workflow/").await.unwrap();
        assert_eq!(keys, vec!["workflow/a/state", "workflow/b/state"]);

        store.delete("workflow/a/state").await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryStateStore::new());
        let policy = RetryPolicy {
            max_retries: 50,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
        };

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                update_json::<u64, _>(store.as_ref(), "counter", &policy, |v| {
                    Ok(v.unwrap_or(0) + 1)
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let entry = store.get("counter").await.unwrap().unwrap();
        assert_eq!(entry.value, json!(10));
    }
}
