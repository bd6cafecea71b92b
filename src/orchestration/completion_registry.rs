//! # Completion Registry
//!
//! Suspend/resume across a process boundary. The dispatcher registers a
//! [`PendingCall`] per chunk invocation and awaits the receiving half of a
//! one-shot channel; the worker's callback arrives as a separate inbound
//! event carrying the token and resolves it. A token resolves at most once.

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::models::{CalculationCallback, Chunk, CompletionToken, PendingCall};

#[derive(Debug)]
struct Waiter {
    call: PendingCall,
    sender: oneshot::Sender<CalculationCallback>,
}

#[derive(Debug, Default)]
pub struct CompletionRegistry {
    pending: DashMap<CompletionToken, Waiter>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh single-use token for one invocation of `chunk`
    pub fn register(
        &self,
        execution_id: &str,
        chunk: Chunk,
    ) -> (PendingCall, oneshot::Receiver<CalculationCallback>) {
        let (sender, receiver) = oneshot::channel();
        let call = PendingCall {
            token: CompletionToken::generate(),
            execution_id: execution_id.to_string(),
            chunk,
            issued_at: Utc::now(),
        };
        self.pending.insert(
            call.token.clone(),
            Waiter {
                call: call.clone(),
                sender,
            },
        );
        debug!(execution_id, sequence = chunk.sequence, token = %call.token, "completion token issued");
        (call, receiver)
    }

    /// Resume the chunk waiting on `callback.completion_token`
    pub fn complete(&self, callback: CalculationCallback) -> Result<PendingCall> {
        let token = callback.completion_token.clone();
        let Some((_, waiter)) = self.pending.remove(&token) else {
            warn!(token = %token, "callback for unknown or already used token");
            return Err(PipelineError::UnknownToken(token.to_string()));
        };
        if waiter.sender.send(callback).is_err() {
            // dispatcher stopped waiting between lookup and send
            return Err(PipelineError::UnknownToken(token.to_string()));
        }
        Ok(waiter.call)
    }

    /// Withdraw a token the dispatcher no longer waits on
    pub fn cancel(&self, token: &CompletionToken) -> bool {
        self.pending.remove(token).is_some()
    }

    pub fn pending_calls(&self) -> Vec<PendingCall> {
        let mut calls: Vec<PendingCall> = self.pending.iter().map(|w| w.call.clone()).collect();
        calls.sort_by_key(|c| (c.issued_at, c.chunk.sequence));
        calls
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ByteRange;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn chunk(sequence: u32) -> Chunk {
        Chunk {
            sequence,
            range: ByteRange::new(0, 10),
        }
    }

    #[test]
    fn test_callback_resumes_waiter_once() {
        let registry = CompletionRegistry::new();
        let (call, receiver) = registry.register("e1", chunk(0));
        assert_eq!(registry.len(), 1);
        let mut waiter = task::spawn(receiver);
        assert_pending!(waiter.poll());

        let resolved = registry
            .complete(CalculationCallback::success(call.token.clone(), "out"))
            .unwrap();
        assert_eq!(resolved.chunk.sequence, 0);
        assert!(waiter.is_woken());
        let callback = assert_ready_ok!(waiter.poll());
        assert_eq!(callback.output_ref.as_deref(), Some("out"));

        let again = registry.complete(CalculationCallback::success(call.token, "out"));
        assert!(matches!(again, Err(PipelineError::UnknownToken(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        let registry = CompletionRegistry::new();
        let err = registry
            .complete(CalculationCallback::success(CompletionToken::generate(), "out"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownToken(_)));
    }

    #[test]
    fn test_cancelled_token_cannot_complete() {
        let registry = CompletionRegistry::new();
        let (call, _receiver) = registry.register("e1", chunk(1));
        assert!(registry.cancel(&call.token));
        assert!(registry
            .complete(CalculationCallback::failure(call.token, vec![]))
            .is_err());
    }

    #[test]
    fn test_dropped_receiver_rejects_callback() {
        let registry = CompletionRegistry::new();
        let (call, receiver) = registry.register("e1", chunk(2));
        drop(receiver);
        assert!(registry
            .complete(CalculationCallback::success(call.token, "out"))
            .is_err());
    }
}
