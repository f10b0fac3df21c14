use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A stored value together with its concurrency tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEntry {
    /// Incremented on every successful write; the first write yields `1`.
    pub etag: u64,
    /// The stored document.
    pub value: serde_json::Value,
}

/// Key/value persistence with per-key optimistic concurrency.
///
/// `expected_etag` semantics for [`put`](StateStore::put):
/// - `None`: unconditional write (last writer wins).
/// - `Some(0)`: create only, fails if the key exists.
/// - `Some(n)`: succeeds only if the current etag is `n`.
///
/// A failed precondition returns [`MaestroError::Conflict`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> MaestroResult<Option<StoreEntry>>;
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_etag: Option<u64>,
    ) -> MaestroResult<u64>;
    async fn delete(&self, key: &str) -> MaestroResult<()>;
    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> MaestroResult<Vec<String>>;
}

pub(crate) fn check_etag(
    key: &str,
    current: Option<u64>,
    expected: Option<u64>,
) -> MaestroResult<()> {
    match expected {
        None => Ok(()),
        Some(want) if current.unwrap_or(0) == want => Ok(()),
        Some(_) => Err(MaestroError::Conflict {
            key: key.to_string(),
        }),
    }
}

/// Read and deserialize a typed value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> MaestroResult<Option<(T, u64)>> {
    match store.get(key).await? {
        Some(entry) => Ok(Some((serde_json::from_value(entry.value)?, entry.etag))),
        None => Ok(None),
    }
}

/// Serialize and write a typed value.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    expected_etag: Option<u64>,
) -> MaestroResult<u64> {
    store.put(key, serde_json::to_value(value)?, expected_etag).await
}

/// Read-modify-write a typed value under its etag.
///
/// `apply` receives the current value (or `None`) and returns the new one. On
/// conflict or transient store errors the whole cycle is retried following
/// `policy`, so `apply` may run more than once.
pub async fn update_json<T, F>(
    store: &dyn StateStore,
    key: &str,
    policy: &RetryPolicy,
    mut apply: F,
) -> MaestroResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> MaestroResult<T>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = async {
            let current = get_json::<T>(store, key).await?;
            let etag = current.as_ref().map_or(0, |(_, e)| *e);
            let next = apply(current.map(|(v, _)| v))?;
            put_json(store, key, &next, Some(etag)).await?;
            Ok::<T, MaestroError>(next)
        }
        .await;

        match outcome {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                debug!(key, attempt, error = %e, "Retrying read-modify-write");
                tokio::time::sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
