//! # Object Store
//!
//! Artifact storage contract: existence check, range read, conditional put
//! and batch delete. Conditional puts are what make terminal chunk markers
//! safe under concurrent redelivery.
//!
//! Version tokens are opaque strings; each backend decides what they mean.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};

/// Precondition for conditional writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    DoesNotExist,
    MatchesVersion(String),
    None,
}

/// A failed precondition is a normal result, not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Success { version: String },
    PreconditionFailed { current_version: String },
}

impl WriteResult {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteResult::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub version: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// `StoreError::ObjectNotFound` when absent
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Reads `[start, end)`, clamping `end` to the object length. A start past
    /// the end of the object is an `InvalidRange`.
    async fn get_range(&self, key: &str, range: Range<u64>) -> StoreResult<Vec<u8>>;

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: WritePrecondition,
    ) -> StoreResult<WriteResult>;

    /// Idempotent
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Deletes every key that exists, returning how many did
    async fn delete_batch(&self, keys: &[String]) -> StoreResult<usize>;

    /// Objects under `prefix`, sorted by key
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>>;

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>>;
}

/// Resolve a requested range against an object of `len` bytes
pub(crate) fn clamp_range(key: &str, range: &Range<u64>, len: u64) -> StoreResult<Range<u64>> {
    if range.start > len {
        return Err(StoreError::InvalidRange {
            key: key.to_string(),
            message: format!("start {} exceeds object length {len}", range.start),
        });
    }
    let end = range.end.min(len);
    if end < range.start {
        return Err(StoreError::InvalidRange {
            key: key.to_string(),
            message: format!("end {end} is before start {}", range.start),
        });
    }
    Ok(range.start..end)
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

/// In-memory object store with numeric versions per key
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::ObjectNotFound {
                key: key.to_string(),
            })
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> StoreResult<Vec<u8>> {
        let objects = self.objects.read();
        let object = objects.get(key).ok_or_else(|| StoreError::ObjectNotFound {
            key: key.to_string(),
        })?;
        let range = clamp_range(key, &range, object.data.len() as u64)?;
        Ok(object.data[range.start as usize..range.end as usize].to_vec())
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: WritePrecondition,
    ) -> StoreResult<WriteResult> {
        let mut objects = self.objects.write();
        let current = objects.get(key);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => match current {
                Some(obj) if obj.version.to_string() == expected => {}
                Some(obj) => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
                None => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: "0".to_string(),
                    });
                }
            },
            WritePrecondition::None => {}
        }

        let version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                version,
                last_modified: Utc::now(),
            },
        );
        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> StoreResult<usize> {
        let mut objects = self.objects.write();
        Ok(keys.iter().filter(|k| objects.remove(*k).is_some()).count())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| o.meta(k))
            .collect())
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        Ok(self.objects.read().get(key).map(|o| o.meta(key)))
    }
}

/// Key layout for per-execution artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKeys {
    prefix: String,
}

impl ObjectKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn execution_prefix(&self, pipeline_id: &str, execution_id: &str) -> String {
        format!("{}/{pipeline_id}/executions/{execution_id}/", self.prefix)
    }

    /// Where the calculation worker writes a chunk's output
    pub fn chunk_output(&self, pipeline_id: &str, execution_id: &str, sequence: u32) -> String {
        format!(
            "{}chunks/{sequence}/output.jsonl",
            self.execution_prefix(pipeline_id, execution_id)
        )
    }

    pub fn chunk_outputs_prefix(&self, pipeline_id: &str, execution_id: &str) -> String {
        format!("{}chunks/", self.execution_prefix(pipeline_id, execution_id))
    }

    /// Terminal marker; existence means the chunk was handled
    pub fn chunk_marker(&self, pipeline_id: &str, execution_id: &str, sequence: u32) -> String {
        format!(
            "{}output/{sequence}.json",
            self.execution_prefix(pipeline_id, execution_id)
        )
    }

    pub fn markers_prefix(&self, pipeline_id: &str, execution_id: &str) -> String {
        format!("{}output/", self.execution_prefix(pipeline_id, execution_id))
    }
}

impl Default for ObjectKeys {
    fn default() -> Self {
        Self::new("pipelines")
    }
}
