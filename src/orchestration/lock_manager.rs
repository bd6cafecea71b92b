//! # Lock Manager
//!
//! Tenant + resource scoped mutual exclusion on top of a [`LockTable`]. The
//! table is an external conditional-write primitive, so holders may live in
//! different processes; expiry (`lock.ttl`) covers a holder that dies.
//!
//! Acquisition returns a [`LockGuard`]. The normal path releases explicitly
//! with [`LockGuard::release`]; a guard dropped without that (the holding
//! future was cancelled or panicked) schedules a best-effort release on the
//! current runtime. Release is always conditional on the holder token.
//!
//! Every acquisition writes a fresh holder token (`{holder}:{uuid}`), so two
//! runs presenting the same holder id still exclude each other. While a guard
//! is alive a heartbeat task renews the lease every third of `lock.ttl`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::retry::poll_delay;
use crate::config::LockConfig;
use crate::error::{LockError, PipelineError, Result, StoreResult};
use crate::logging::log_lock_operation;
use crate::models::{LockKey, LockRecord};
use crate::storage::{LockAttempt, LockTable};

/// Polling backs off up to this multiple of `lock.poll_interval`
const MAX_POLL_FACTOR: u32 = 8;

#[derive(Clone)]
pub struct LockManager {
    table: Arc<dyn LockTable>,
    config: LockConfig,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(table: Arc<dyn LockTable>, config: LockConfig) -> Self {
        Self { table, config }
    }

    pub fn table(&self) -> &Arc<dyn LockTable> {
        &self.table
    }

    /// Wait until the lock is free (or expired) and take it, giving up after
    /// `lock.acquire_timeout`
    #[instrument(skip(self), fields(lock = %key))]
    pub async fn acquire(&self, key: &LockKey, holder: &str) -> std::result::Result<LockGuard, LockError> {
        let name = key.name();
        let token = format!("{holder}:{}", Uuid::new_v4().simple());
        let holder = token.as_str();
        let started = Instant::now();
        let timeout = self.config.acquire_timeout();
        let ttl = self.config.ttl();
        let mut attempt = 0u32;

        loop {
            match self.table.try_acquire(&name, holder, ttl).await? {
                LockAttempt::Acquired(record) => {
                    log_lock_operation("acquire", &name, holder, "acquired");
                    let heartbeat = spawn_heartbeat(Arc::clone(&self.table), record.clone(), ttl);
                    return Ok(LockGuard {
                        table: Arc::clone(&self.table),
                        record,
                        released: false,
                        heartbeat,
                    });
                }
                LockAttempt::Held(current) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        log_lock_operation("acquire", &name, holder, "timeout");
                        return Err(LockError::Timeout {
                            name,
                            holder: Some(current.holder),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    let delay = poll_delay(self.config.poll_interval(), attempt, MAX_POLL_FACTOR)
                        .min(timeout.saturating_sub(waited).max(Duration::from_millis(1)));
                    debug!(
                        lock = %name,
                        holder,
                        current_holder = %current.holder,
                        delay_ms = delay.as_millis() as u64,
                        "lock busy, waiting"
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run `f` while holding the lock. The lock is released whether `f`
    /// succeeds or fails.
    pub async fn with_lock<F, Fut, T>(&self, key: &LockKey, holder: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(key, holder).await?;
        let result = f().await;
        match guard.release().await {
            Ok(_) => result,
            Err(release_error) => {
                warn!(lock = %key, holder, error = %release_error, "lock release failed, expiry will reclaim it");
                match result {
                    Ok(_) => Err(PipelineError::Lock(LockError::Store(release_error))),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Renew the lease until aborted or until the lock turns out to be lost
fn spawn_heartbeat(table: Arc<dyn LockTable>, record: LockRecord, ttl: Duration) -> Option<JoinHandle<()>> {
    let interval = ttl / 3;
    if interval.is_zero() {
        return None;
    }
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match table.renew(&record.name, &record.holder, ttl).await {
                Ok(true) => debug!(lock = %record.name, holder = %record.holder, "lock lease renewed"),
                Ok(false) => {
                    warn!(lock = %record.name, holder = %record.holder, "lock lost before its lease was renewed");
                    return;
                }
                Err(e) => warn!(lock = %record.name, holder = %record.holder, error = %e, "lock renewal failed"),
            }
        }
    }))
}

/// Scoped ownership of one lock
pub struct LockGuard {
    table: Arc<dyn LockTable>,
    record: LockRecord,
    released: bool,
    heartbeat: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("record", &self.record)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }

    /// Returns whether this holder still owned the lock
    pub async fn release(mut self) -> StoreResult<bool> {
        self.released = true;
        self.stop_heartbeat();
        let owned = self
            .table
            .release(&self.record.name, &self.record.holder)
            .await?;
        if !owned {
            warn!(
                lock = %self.record.name,
                holder = %self.record.holder,
                "lock was no longer held at release (expired and taken over?)"
            );
        }
        log_lock_operation("release", &self.record.name, &self.record.holder, "released");
        Ok(owned)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.released {
            return;
        }
        let table = Arc::clone(&self.table);
        let name = self.record.name.clone();
        let holder = self.record.holder.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(lock = %name, holder = %holder, "lock guard dropped without release, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = table.release(&name, &holder).await {
                        warn!(lock = %name, holder = %holder, error = %e, "background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(lock = %name, holder = %holder, "no runtime to release dropped lock guard, relying on expiry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLockTable;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn manager(acquire_timeout_seconds: u64) -> LockManager {
        LockManager::new(
            Arc::new(MemoryLockTable::new()),
            LockConfig {
                ttl_seconds: 3_600,
                acquire_timeout_seconds,
                poll_interval_ms: 50,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_holder_waits_for_release() {
        let locks = manager(60);
        let key = LockKey::new("t1", "pipeline:p1");
        let first = locks.acquire(&key, "e1").await.unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            let released = Arc::clone(&released);
            tokio::spawn(async move {
                let guard = locks.acquire(&key, "e2").await.unwrap();
                assert!(released.load(Ordering::SeqCst), "acquired before the first holder released");
                guard.release().await.unwrap()
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        released.store(true, Ordering::SeqCst);
        assert!(first.release().await.unwrap());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let locks = manager(2);
        let key = LockKey::new("t1", "pipeline:p1");
        let _held = locks.acquire(&key, "e1").await.unwrap();
        let err = locks.acquire(&key, "e2").await.unwrap_err();
        match err {
            LockError::Timeout { holder, .. } => assert!(holder.unwrap().starts_with("e1:")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_releases_on_error() {
        let locks = manager(1);
        let key = LockKey::new("t1", "pipeline:p1");
        let result: Result<()> = locks
            .with_lock(&key, "e1", || async { Err(PipelineError::data("boom")) })
            .await;
        assert!(result.is_err());
        assert!(locks.table().current(&key.name()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrelated_resources_do_not_contend() {
        let locks = manager(1);
        let a = locks.acquire(&LockKey::new("t1", "pipeline:p1"), "e1").await.unwrap();
        let b = locks.acquire(&LockKey::new("t1", "pipeline:p2"), "e2").await.unwrap();
        let c = locks.acquire(&LockKey::new("t2", "pipeline:p1"), "e3").await.unwrap();
        for guard in [a, b, c] {
            assert!(guard.release().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let locks = manager(1);
        let key = LockKey::new("t1", "pipeline:p1");
        drop(locks.acquire(&key, "e1").await.unwrap());
        tokio::task::yield_now().await;
        let guard = locks.acquire(&key, "e2").await.unwrap();
        assert!(guard.record().holder.starts_with("e2:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_holder_id_does_not_reenter() {
        let locks = manager(2);
        let key = LockKey::new("t1", "pipeline:p1");
        let first = locks.acquire(&key, "e1").await.unwrap();
        let first_holder = first.record().holder.clone();
        let err = locks.acquire(&key, "e1").await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(first.release().await.unwrap());
        let second = locks.acquire(&key, "e1").await.unwrap();
        assert_ne!(second.record().holder, first_holder);
    }

    /// Counts renewals on top of the in-memory table
    #[derive(Default)]
    struct RenewCounting {
        inner: MemoryLockTable,
        renewals: AtomicU32,
    }

    #[async_trait::async_trait]
    impl LockTable for RenewCounting {
        async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<LockAttempt> {
            self.inner.try_acquire(name, holder, ttl).await
        }

        async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            self.inner.renew(name, holder, ttl).await
        }

        async fn release(&self, name: &str, holder: &str) -> StoreResult<bool> {
            self.inner.release(name, holder).await
        }

        async fn current(&self, name: &str) -> StoreResult<Option<LockRecord>> {
            self.inner.current(name).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_lease_is_renewed_until_release() {
        let table = Arc::new(RenewCounting::default());
        let locks = LockManager::new(
            Arc::clone(&table) as Arc<dyn LockTable>,
            LockConfig {
                ttl_seconds: 3,
                acquire_timeout_seconds: 1,
                poll_interval_ms: 50,
            },
        );
        let key = LockKey::new("t1", "pipeline:p1");
        let guard = locks.acquire(&key, "e1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(table.renewals.load(Ordering::SeqCst), 3);

        assert!(guard.release().await.unwrap());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(table.renewals.load(Ordering::SeqCst), 3);
    }
}
