//! Failure injection for exercising retry paths in tests.
//!
//! Only compiled for this crate's tests or with the `testing` feature.

use crate::store::{StateStore, StoreEntry};
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Wraps another store and fails the next `n` operations with
/// [`MaestroError::StoreUnavailable`]. Used to exercise retry paths.
pub struct FlakyStore {
    inner: Arc<dyn StateStore>,
    failures_left: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn trip(&self, op: &str) -> MaestroResult<()> {
        let tripped = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(MaestroError::StoreUnavailable(format!("injected failure on {op}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, key: &str) -> MaestroResult<Option<StoreEntry>> {
        self.trip("get")?;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_etag: Option<u64>,
    ) -> MaestroResult<u64> {
        self.trip("put")?;
        self.inner.put(key, value, expected_etag).await
    }

    async fn delete(&self, key: &str) -> MaestroResult<()> {
        self.trip("delete")?;
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> MaestroResult<Vec<String>> {
        self.trip("keys")?;
        self.inner.keys(prefix).await
    }
}
