use crate::store::{check_etag, StateStore, StoreEntry};
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// File-based store: one JSON document per key under `dir`.
///
/// Key segments separated by `/` become nested directories, so
/// `workflow/abc/state` lives at `{dir}/workflow/abc/state.json`. Writes go to
/// a temporary sibling first and are renamed into place.
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub async fn new(dir: impl Into<PathBuf>) -> MaestroResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> MaestroResult<PathBuf> {
        let mut path = self.dir.clone();
        let segments: Vec<&str> = key.split('/').collect();
        for (i, seg) in segments.iter().enumerate() {
            if seg.is_empty() || *seg == "." || *seg == ".." || seg.contains('\\') {
                return Err(MaestroError::InvalidInput(format!("Invalid store key: {key}")));
            }
            if i + 1 == segments.len() {
                path.push(format!("{seg}.json"));
            } else {
                path.push(seg);
            }
        }
        Ok(path)
    }

    async fn read_entry(path: &Path) -> MaestroResult<Option<StoreEntry>> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MaestroError::StoreUnavailable(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> MaestroResult<Option<StoreEntry>> {
        let path = self.key_path(key)?;
        Self::read_entry(&path).await
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_etag: Option<u64>,
    ) -> MaestroResult<u64> {
        let path = self.key_path(key)?;
        let _guard = self.write_lock.lock().await;

        let current = Self::read_entry(&path).await?.map(|e| e.etag);
        check_etag(key, current, expected_etag)?;
        let entry = StoreEntry {
            etag: current.unwrap_or(0) + 1,
            value,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(entry.etag)
    }

    async fn delete(&self, key: &str) -> MaestroResult<()> {
        let path = self.key_path(key)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> MaestroResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.dir.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), format!("{key_prefix}{name}/")));
                } else if let Some(stem) = name.strip_suffix(".json") {
                    let key = format!("{key_prefix}{stem}");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_nested_keys_roundtrip_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(tmp.path()).await.unwrap();

        store
            .put("workflow/wf-1/state", json!({"status": "RUNNING"}), Some(0))
            .await
            .unwrap();
        assert!(tmp.path().join("workflow/wf-1/state.json").exists());

        let entry = store.get("workflow/wf-1/state").await.unwrap().unwrap();
        assert_eq!(entry.etag, 1);
        assert_eq!(entry.value["status"], "RUNNING");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = FileStateStore::new(tmp.path()).await.unwrap();
            store.put("registry/agents", json!({"a": 1}), None).await.unwrap();
            store.put("registry/agents", json!({"a": 2}), Some(1)).await.unwrap();
        }
        let reopened = FileStateStore::new(tmp.path()).await.unwrap();
        let entry = reopened.get("registry/agents").await.unwrap().unwrap();
        assert_eq!(entry.etag, 2);
        assert_eq!(entry.value, json!({"a": 2}));

        let err = reopened
            .put("registry/agents", json!({}), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_keys_walks_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(tmp.path()).await.unwrap();
        store.put("workflow/b/state", json!(1), None).await.unwrap();
        store.put("workflow/a/state", json!(1), None).await.unwrap();
        store.put("agents/MathAgent/session/a", json!(1), None).await.unwrap();

        assert_eq!(
            store.keys("workflow/").await.unwrap(),
            vec!["workflow/a/state", "workflow/b/state"]
        );
        assert_eq!(store.keys("").await.unwrap().len(), 3);

        store.delete("workflow/a/state").await.unwrap();
        store.delete("workflow/a/state").await.unwrap();
        assert_eq!(store.keys("workflow/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(tmp.path()).await.unwrap();
        let err = store.get("../etc/passwd").await.unwrap_err();
        assert_eq!(err.code(), "InvalidInputError");
        assert!(store.get("workflow//state").await.is_err());
    }
}
