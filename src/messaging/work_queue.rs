//! Deferred-work queue contract and its in-memory implementation.
//!
//! Reads lease messages for a visibility timeout instead of removing them;
//! a consumer deletes a message once it has been handled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::message::{QueuedMessage, WorkMessage};
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, queue: &str, message: &WorkMessage) -> StoreResult<i64>;

    /// Lease up to `limit` visible messages, oldest first
    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> StoreResult<Vec<QueuedMessage>>;

    /// Returns whether the message existed
    async fn delete(&self, queue: &str, message_id: i64) -> StoreResult<bool>;

    /// Messages in the queue, leased or not
    async fn depth(&self, queue: &str) -> StoreResult<usize>;
}

#[derive(Debug, Clone)]
struct Slot {
    payload: serde_json::Value,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    queues: BTreeMap<String, BTreeMap<i64, Slot>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn send(&self, queue: &str, message: &WorkMessage) -> StoreResult<i64> {
        let payload = message.to_json().map_err(|e| StoreError::queue(queue, e))?;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let now = Utc::now();
        state.queues.entry(queue.to_string()).or_default().insert(
            id,
            Slot {
                payload,
                read_count: 0,
                enqueued_at: now,
                visible_at: now,
            },
        );
        debug!(queue, message_id = id, kind = message.kind(), "message enqueued");
        Ok(id)
    }

    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> StoreResult<Vec<QueuedMessage>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| StoreError::queue(queue, e))?;
        let mut state = self.state.lock();
        let Some(slots) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut leased = Vec::new();
        for (id, slot) in slots.iter_mut().filter(|(_, s)| s.visible_at <= now).take(limit) {
            slot.read_count += 1;
            slot.visible_at = now + lease;
            let message: WorkMessage =
                serde_json::from_value(slot.payload.clone()).map_err(|e| StoreError::queue(queue, e))?;
            leased.push(QueuedMessage {
                id: *id,
                queue: queue.to_string(),
                message,
                read_count: slot.read_count,
                enqueued_at: slot.enqueued_at,
            });
        }
        Ok(leased)
    }

    async fn delete(&self, queue: &str, message_id: i64) -> StoreResult<bool> {
        Ok(self
            .state
            .lock()
            .queues
            .get_mut(queue)
            .and_then(|slots| slots.remove(&message_id))
            .is_some())
    }

    async fn depth(&self, queue: &str) -> StoreResult<usize> {
        Ok(self.state.lock().queues.get(queue).map_or(0, BTreeMap::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> WorkMessage {
        WorkMessage::AggregationJob {
            job_id: id.into(),
            tenant_id: "t".into(),
            pipeline_id: "p".into(),
        }
    }

    #[tokio::test]
    async fn test_leased_messages_are_hidden_until_deleted() {
        let queue = MemoryWorkQueue::new();
        queue.send("jobs", &job("a")).await.unwrap();
        queue.send("jobs", &job("b")).await.unwrap();

        let first = queue.read("jobs", Duration::from_secs(60), 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message, job("a"));
        assert_eq!(first[0].read_count, 1);

        let second = queue.read("jobs", Duration::from_secs(60), 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message, job("b"));

        assert!(queue.delete("jobs", first[0].id).await.unwrap());
        assert_eq!(queue.depth("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = MemoryWorkQueue::new();
        queue.send("jobs", &job("a")).await.unwrap();
        queue.read("jobs", Duration::ZERO, 1).await.unwrap();
        let again = queue.read("jobs", Duration::ZERO, 1).await.unwrap();
        assert_eq!(again[0].read_count, 2);
    }
}
