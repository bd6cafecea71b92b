//! Local-filesystem object store. Keys map onto paths below a root
//! directory; version tokens are derived from size and modification time.
//!
//! Conditional writes are serialized by an in-process mutex, so the
//! precondition guarantees hold for a single process only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::object_store::{clamp_range, ObjectMeta, ObjectStore, WritePrecondition, WriteResult};
use crate::error::{StoreError, StoreResult};

#[derive(Debug)]
pub struct LocalFsObjectStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalFsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StoreError::io(key, "key must be a relative path without '..'"));
        }
        Ok(self.root.join(relative))
    }

    async fn meta_for(&self, key: &str, path: &Path) -> StoreResult<Option<ObjectMeta>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {
                let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
                let nanos = modified
                    .and_then(|m| m.timestamp_nanos_opt())
                    .unwrap_or_default();
                Ok(Some(ObjectMeta {
                    key: key.to_string(),
                    size: meta.len(),
                    version: format!("{}-{nanos}", meta.len()),
                    last_modified: modified,
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    fn not_found_or_io(key: &str, path: &Path, err: std::io::Error) -> StoreError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::ObjectNotFound {
                key: key.to_string(),
            }
        } else {
            StoreError::io(path.display().to_string(), err)
        }
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::not_found_or_io(key, &path, e))
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found_or_io(key, &path, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))?
            .len();
        let range = clamp_range(key, &range, len)?;

        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))?;
        Ok(buf)
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: WritePrecondition,
    ) -> StoreResult<WriteResult> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;

        let current = self.meta_for(key, &path).await?;
        match (&precondition, &current) {
            (WritePrecondition::DoesNotExist, Some(meta)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: meta.version.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(meta)) if &meta.version != expected => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: meta.version.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                });
            }
            _ => {}
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent.display().to_string(), e))?;
        }
        let staging = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&staging, &data)
            .await
            .map_err(|e| StoreError::io(staging.display().to_string(), e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))?;

        let version = self
            .meta_for(key, &path)
            .await?
            .map(|m| m.version)
            .unwrap_or_default();
        debug!(key, bytes = data.len(), "object written");
        Ok(WriteResult::Success { version })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    async fn delete_batch(&self, keys: &[String]) -> StoreResult<usize> {
        let mut deleted = 0;
        for key in keys {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path.display().to_string(), e)),
            }
        }
        Ok(deleted)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(dir.display().to_string(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(dir.display().to_string(), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(path.display().to_string(), e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.contains(".tmp-") {
                    if let Some(meta) = self.meta_for(&key, &path).await? {
                        found.push(meta);
                    }
                }
            }
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        let path = self.path_for(key)?;
        self.meta_for(key, &path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_and_range() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        store
            .put("p/e/chunks/0/output.jsonl", b"abcdef".to_vec(), WritePrecondition::None)
            .await
            .unwrap();

        assert_eq!(store.get("p/e/chunks/0/output.jsonl").await.unwrap(), b"abcdef");
        assert_eq!(
            store.get_range("p/e/chunks/0/output.jsonl", 1..3).await.unwrap(),
            b"bc"
        );
        assert_eq!(store.head("p/e/chunks/0/output.jsonl").await.unwrap().unwrap().size, 6);
    }

    #[tokio::test]
    async fn test_marker_written_once() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        let first = store
            .put("m/0.json", b"{}".to_vec(), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(first.is_success());
        let second = store
            .put("m/0.json", b"{}".to_vec(), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(!second.is_success());
    }

    #[tokio::test]
    async fn test_list_delete_and_missing_objects() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        for key in ["x/a", "x/b", "y/c"] {
            store.put(key, b"1".to_vec(), WritePrecondition::None).await.unwrap();
        }
        let keys: Vec<String> = store.list("x/").await.unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["x/a", "x/b"]);

        assert_eq!(store.delete_batch(&keys).await.unwrap(), 2);
        assert!(store.head("x/a").await.unwrap().is_none());
        assert!(matches!(
            store.get("x/a").await,
            Err(StoreError::ObjectNotFound { .. })
        ));
        store.delete("x/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
    }
}
