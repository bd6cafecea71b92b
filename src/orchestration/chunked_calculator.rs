//! # Chunked Calculator
//!
//! Admission-controlled fan-out of an execution's chunks to external
//! calculation workers.
//!
//! Each chunk invocation carries a single-use completion token issued by the
//! [`CompletionRegistry`]; the dispatcher then suspends until the worker's
//! callback resolves the token or `calculation.callback_timeout` elapses. A
//! semaphore of `calculation.max_concurrency` permits gates submission.
//!
//! Transient worker errors (unavailable, throttled) are retried per chunk
//! with exponential backoff. A chunk that exhausts its attempts, times out or
//! reports calculation errors is returned as a failed [`CalculationResult`];
//! its siblings carry on.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::completion_registry::CompletionRegistry;
use super::retry::RetryPolicy;
use crate::config::CalculationConfig;
use crate::error::{PipelineError, Result};
use crate::logging::log_chunk_operation;
use crate::messaging::{WorkMessage, WorkQueue};
use crate::models::{
    CalculationCallback, CalculationRequest, CalculationResult, Chunk, ChunkPlan, ExecutionContext,
    SourceContext,
};
use crate::storage::ObjectKeys;

/// Errors a worker invocation can fail with before any callback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("calculation worker unavailable: {0}")]
    Unavailable(String),

    #[error("calculation worker throttled: {0}")]
    Throttled(String),

    #[error("calculation worker rejected the request: {0}")]
    Rejected(String),
}

impl WorkerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Unavailable(_) | WorkerError::Throttled(_))
    }
}

/// Hands a chunk to a calculation worker. Returning `Ok` means the request
/// was accepted; the result arrives later through the completion registry.
#[async_trait]
pub trait CalculationWorker: Send + Sync {
    async fn invoke(&self, request: &CalculationRequest) -> std::result::Result<(), WorkerError>;
}

/// Publishes requests on the deferred-work queue for out-of-process workers
pub struct QueueCalculationWorker {
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
}

impl QueueCalculationWorker {
    pub fn new(queue: Arc<dyn WorkQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl CalculationWorker for QueueCalculationWorker {
    async fn invoke(&self, request: &CalculationRequest) -> std::result::Result<(), WorkerError> {
        let message = WorkMessage::CalculationRequest(request.clone());
        self.queue
            .send(&self.queue_name, &message)
            .await
            .map(|_| ())
            .map_err(|e| WorkerError::Unavailable(e.to_string()))
    }
}

pub struct ChunkedCalculator {
    worker: Arc<dyn CalculationWorker>,
    registry: Arc<CompletionRegistry>,
    config: CalculationConfig,
    retry: RetryPolicy,
    keys: ObjectKeys,
}

impl ChunkedCalculator {
    pub fn new(
        worker: Arc<dyn CalculationWorker>,
        registry: Arc<CompletionRegistry>,
        config: CalculationConfig,
        keys: ObjectKeys,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            worker,
            registry,
            config,
            retry,
            keys,
        }
    }

    pub fn registry(&self) -> &Arc<CompletionRegistry> {
        &self.registry
    }

    /// Entry point for inbound worker callbacks
    pub fn complete(&self, callback: CalculationCallback) -> Result<()> {
        self.registry.complete(callback).map(|_| ())
    }

    /// Calculate every chunk of `plan`. Results are ordered by sequence and
    /// there is exactly one per chunk.
    ///
    /// Nothing outlives `deadline`: chunks not admitted by then are failed
    /// without an invocation, retries stop, and callback waits are cut short.
    #[instrument(skip(self, plan, source, deadline), fields(execution_id = %context.execution_id, chunks = plan.len()))]
    pub async fn dispatch(
        &self,
        context: &ExecutionContext,
        plan: &ChunkPlan,
        source: &SourceContext,
        deadline: Instant,
    ) -> Vec<CalculationResult> {
        let permits = Semaphore::new(self.config.max_concurrency.max(1));
        let mut calls = Vec::with_capacity(plan.chunks.len());
        for chunk in &plan.chunks {
            calls.push(self.admit_chunk(context, *chunk, source, &permits, deadline));
        }

        let mut results = join_all(calls).await;
        results.sort_by_key(|r| r.sequence);

        let failed = results.iter().filter(|r| r.is_failed()).count();
        info!(
            execution_id = %context.execution_id,
            chunks = results.len(),
            failed,
            "chunk calculation finished"
        );
        results
    }

    async fn admit_chunk(
        &self,
        context: &ExecutionContext,
        chunk: Chunk,
        source: &SourceContext,
        permits: &Semaphore,
        deadline: Instant,
    ) -> CalculationResult {
        let _permit = match tokio::time::timeout_at(deadline, permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return CalculationResult::failed(
                    chunk.sequence,
                    vec!["chunk admission closed".to_string()],
                    0,
                );
            }
            Err(_) => return Self::budget_exhausted(context, chunk.sequence, 0),
        };
        self.calculate_chunk(context, chunk, source, deadline).await
    }

    async fn calculate_chunk(
        &self,
        context: &ExecutionContext,
        chunk: Chunk,
        source: &SourceContext,
        deadline: Instant,
    ) -> CalculationResult {
        let output_key = self
            .keys
            .chunk_output(&context.pipeline_id, &context.execution_id, chunk.sequence);
        let mut attempts = 0u32;

        loop {
            if Instant::now() >= deadline {
                return Self::budget_exhausted(context, chunk.sequence, attempts);
            }
            attempts += 1;
            let (call, receiver) = self.registry.register(&context.execution_id, chunk);
            let request = CalculationRequest {
                context: context.clone(),
                chunk,
                source: source.clone(),
                output_key: output_key.clone(),
                completion_token: call.token.clone(),
            };

            match self.worker.invoke(&request).await {
                Ok(()) => {
                    log_chunk_operation("dispatch", &context.execution_id, chunk.sequence, "submitted", None);
                    return self
                        .await_callback(context, chunk, call.token, receiver, attempts, deadline)
                        .await;
                }
                Err(err) => {
                    self.registry.cancel(&call.token);
                    if err.is_transient() && self.retry.should_retry(attempts) {
                        let delay = self.retry.delay_for(attempts);
                        warn!(
                            execution_id = %context.execution_id,
                            sequence = chunk.sequence,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient worker error, retrying"
                        );
                        tokio::time::sleep_until(bounded(delay, deadline)).await;
                        continue;
                    }
                    let message = if err.is_transient() {
                        format!("calculation worker failed after {attempts} attempts: {err}")
                    } else {
                        err.to_string()
                    };
                    log_chunk_operation(
                        "dispatch",
                        &context.execution_id,
                        chunk.sequence,
                        "failed",
                        Some(&message),
                    );
                    return CalculationResult::failed(chunk.sequence, vec![message], attempts);
                }
            }
        }
    }

    async fn await_callback(
        &self,
        context: &ExecutionContext,
        chunk: Chunk,
        token: crate::models::CompletionToken,
        receiver: tokio::sync::oneshot::Receiver<CalculationCallback>,
        attempts: u32,
        deadline: Instant,
    ) -> CalculationResult {
        let timeout = self.config.callback_timeout();
        let until = bounded(timeout, deadline);
        match tokio::time::timeout_at(until, receiver).await {
            Ok(Ok(callback)) => {
                let result = CalculationResult::from_callback(chunk.sequence, callback, attempts);
                let status = if result.is_failed() { "failed" } else { "calculated" };
                log_chunk_operation("callback", &context.execution_id, chunk.sequence, status, None);
                result
            }
            Ok(Err(_)) => {
                debug!(sequence = chunk.sequence, "completion token withdrawn before callback");
                CalculationResult::failed(
                    chunk.sequence,
                    vec!["completion token withdrawn before the worker reported back".to_string()],
                    attempts,
                )
            }
            Err(_) => {
                self.registry.cancel(&token);
                if until >= deadline {
                    return Self::budget_exhausted(context, chunk.sequence, attempts);
                }
                let message = format!(
                    "calculation callback timed out after {}s",
                    timeout.as_secs()
                );
                log_chunk_operation("callback", &context.execution_id, chunk.sequence, "timeout", Some(&message));
                CalculationResult::failed(chunk.sequence, vec![message], attempts)
            }
        }
    }

    fn budget_exhausted(context: &ExecutionContext, sequence: u32, attempts: u32) -> CalculationResult {
        let message = "execution budget exhausted before the chunk completed".to_string();
        log_chunk_operation("dispatch", &context.execution_id, sequence, "expired", Some(&message));
        CalculationResult::failed(sequence, vec![message], attempts)
    }
}

/// `delay` from now, but never past `deadline`
fn bounded(delay: Duration, deadline: Instant) -> Instant {
    Instant::now()
        .checked_add(delay)
        .map_or(deadline, |at| at.min(deadline))
}

impl From<WorkerError> for PipelineError {
    fn from(err: WorkerError) -> Self {
        if err.is_transient() {
            PipelineError::transient(err.to_string())
        } else {
            PipelineError::data(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MemoryWorkQueue;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn context() -> ExecutionContext {
        ExecutionContext {
            tenant_id: "t1".into(),
            pipeline_id: "p1".into(),
            execution_id: "e1".into(),
            group_context_id: "/acme".into(),
        }
    }

    fn source(size: u64) -> SourceContext {
        SourceContext {
            input_key: "input.jsonl".into(),
            object_size: size,
            pipeline_version: 1,
            outputs: vec![],
        }
    }

    /// Replies through the registry from a spawned task; fails the first
    /// `transient_failures` invocations of sequence 1.
    struct ScriptedWorker {
        registry: Arc<CompletionRegistry>,
        transient_failures: u32,
        seen: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        tokens: Mutex<Vec<String>>,
    }

    impl ScriptedWorker {
        fn new(registry: Arc<CompletionRegistry>, transient_failures: u32) -> Self {
            Self {
                registry,
                transient_failures,
                seen: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
                tokens: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CalculationWorker for Arc<ScriptedWorker> {
        async fn invoke(&self, request: &CalculationRequest) -> std::result::Result<(), WorkerError> {
            self.tokens.lock().unwrap().push(request.completion_token.to_string());
            if request.chunk.sequence == 1 && self.seen.fetch_add(1, Ordering::SeqCst) < self.transient_failures {
                return Err(WorkerError::Throttled("rate exceeded".into()));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let worker = Arc::clone(self);
            let token = request.completion_token.clone();
            let output = request.output_key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                worker.in_flight.fetch_sub(1, Ordering::SeqCst);
                worker
                    .registry
                    .complete(CalculationCallback::success(token, output))
                    .unwrap();
            });
            Ok(())
        }
    }

    fn calculator(worker: Arc<dyn CalculationWorker>, registry: Arc<CompletionRegistry>, max: usize) -> ChunkedCalculator {
        let config = CalculationConfig {
            max_concurrency: max,
            callback_timeout_seconds: 5,
            ..CalculationConfig::default()
        };
        ChunkedCalculator::new(worker, registry, config, ObjectKeys::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded_and_results_ordered() {
        let registry = Arc::new(CompletionRegistry::new());
        let worker = Arc::new(ScriptedWorker::new(Arc::clone(&registry), 0));
        let calc = calculator(Arc::new(Arc::clone(&worker)), Arc::clone(&registry), 3);
        let plan = ChunkPlan::plan("input.jsonl", 10_000, 1_000).unwrap();

        let results = calc.dispatch(&context(), &plan, &source(10_000), far()).await;
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| !r.is_failed()));
        assert_eq!(
            results.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            (0..10).collect::<Vec<_>>()
        );
        assert!(worker.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_with_fresh_tokens() {
        let registry = Arc::new(CompletionRegistry::new());
        let worker = Arc::new(ScriptedWorker::new(Arc::clone(&registry), 2));
        let calc = calculator(Arc::new(Arc::clone(&worker)), Arc::clone(&registry), 10);
        let plan = ChunkPlan::plan("input.jsonl", 2_000, 1_000).unwrap();

        let results = calc.dispatch(&context(), &plan, &source(2_000), far()).await;
        assert!(!results[1].is_failed());
        assert_eq!(results[1].attempts, 3);

        let tokens = worker.tokens.lock().unwrap().clone();
        let unique: std::collections::HashSet<_> = tokens.iter().collect();
        assert_eq!(unique.len(), tokens.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_only_that_chunk() {
        let registry = Arc::new(CompletionRegistry::new());
        let worker = Arc::new(ScriptedWorker::new(Arc::clone(&registry), u32::MAX));
        let calc = calculator(Arc::new(Arc::clone(&worker)), Arc::clone(&registry), 10);
        let plan = ChunkPlan::plan("input.jsonl", 2_000, 1_000).unwrap();

        let results = calc.dispatch(&context(), &plan, &source(2_000), far()).await;
        assert!(!results[0].is_failed());
        assert!(results[1].is_failed());
        assert_eq!(results[1].attempts, 6);
        assert!(results[1].errors[0].contains("after 6 attempts"));
    }

    struct SilentWorker;

    #[async_trait]
    impl CalculationWorker for SilentWorker {
        async fn invoke(&self, _request: &CalculationRequest) -> std::result::Result<(), WorkerError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSilentWorker {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CalculationWorker for Arc<CountingSilentWorker> {
        async fn invoke(&self, _request: &CalculationRequest) -> std::result::Result<(), WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(86_400)
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_callback_times_out() {
        let registry = Arc::new(CompletionRegistry::new());
        let calc = calculator(Arc::new(SilentWorker), Arc::clone(&registry), 10);
        let plan = ChunkPlan::plan("input.jsonl", 500, 1_000).unwrap();

        let results = calc.dispatch(&context(), &plan, &source(500), far()).await;
        assert!(results[0].is_failed());
        assert!(results[0].errors[0].contains("timed out"));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_waits_short_and_skips_unadmitted_chunks() {
        let registry = Arc::new(CompletionRegistry::new());
        let worker = Arc::new(CountingSilentWorker::default());
        let config = CalculationConfig {
            max_concurrency: 1,
            callback_timeout_seconds: 600,
            ..CalculationConfig::default()
        };
        let calc = ChunkedCalculator::new(
            Arc::new(Arc::clone(&worker)),
            Arc::clone(&registry),
            config,
            ObjectKeys::default(),
        );
        let plan = ChunkPlan::plan("input.jsonl", 3_000, 1_000).unwrap();

        let started = Instant::now();
        let deadline = started + Duration::from_secs(1);
        let results = calc.dispatch(&context(), &plan, &source(3_000), deadline).await;

        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_failed() && r.errors[0].contains("budget exhausted")));
        assert_eq!(results[0].attempts, 1);
        assert_eq!(results[2].attempts, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_stops_at_the_deadline() {
        let registry = Arc::new(CompletionRegistry::new());
        let worker = Arc::new(ScriptedWorker::new(Arc::clone(&registry), u32::MAX));
        let calc = calculator(Arc::new(Arc::clone(&worker)), Arc::clone(&registry), 10);
        let plan = ChunkPlan::plan("input.jsonl", 2_000, 1_000).unwrap();

        let deadline = Instant::now() + Duration::from_millis(1);
        let results = calc.dispatch(&context(), &plan, &source(2_000), deadline).await;
        assert!(results[1].is_failed());
        assert!(results[1].attempts < 6);
        assert!(results[1].errors[0].contains("budget exhausted"));
    }

    #[tokio::test]
    async fn test_queue_worker_publishes_requests() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let worker = QueueCalculationWorker::new(queue.clone(), "calculation_requests");
        let registry = CompletionRegistry::new();
        let (call, _rx) = registry.register("e1", ChunkPlan::plan("in", 10, 10).unwrap().chunks[0]);
        let request = CalculationRequest {
            context: context(),
            chunk: call.chunk,
            source: source(10),
            output_key: "out".into(),
            completion_token: call.token,
        };
        worker.invoke(&request).await.unwrap();
        assert_eq!(queue.depth("calculation_requests").await.unwrap(), 1);
    }
}
