//! Pending-call bookkeeping for request/response correlation.
//!
//! One [`PendingCall`] tracks one outstanding invoke from the moment its
//! envelope is handed to the transport until a response arrives, the
//! deadline elapses, or the owning client shuts down. Completion is
//! idempotent: whichever of those happens first wins, and anything arriving
//! afterwards is dropped.

use crate::error::MeshError;
use serde_json::Value;
use std::cell::Cell;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// An outstanding invoke awaiting its correlated response.
pub(crate) struct PendingCall {
    /// The invoke channel name, kept for diagnostics.
    channel: String,

    /// Oneshot sender delivering the outcome to the waiting caller.
    ///
    /// Wrapped in `Option` so completion can consume it exactly once.
    sender: Cell<Option<oneshot::Sender<Result<Value, MeshError>>>>,

    /// When the request was sent.
    sent_at: Instant,

    /// Set by the first completion; later completions are ignored.
    completed: Cell<bool>,
}

impl PendingCall {
    pub(crate) fn new(
        channel: impl Into<String>,
        sender: oneshot::Sender<Result<Value, MeshError>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender: Cell::new(Some(sender)),
            sent_at: Instant::now(),
            completed: Cell::new(false),
        }
    }

    pub(crate) fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn elapsed(&self) -> std::time::Duration {
        self.sent_at.elapsed()
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.get()
    }

    /// Deliver the outcome to the caller. Idempotent: only the first
    /// completion is delivered.
    pub(crate) fn complete(&self, result: Result<Value, MeshError>) {
        if self.completed.replace(true) {
            return;
        }
        if let Some(sender) = self.sender.take() {
            if sender.send(result).is_err() {
                // Caller already gave up (timed out or was dropped).
                tracing::debug!(
                    channel = %self.channel,
                    elapsed_ms = self.elapsed().as_millis() as u64,
                    "invoke response discarded, caller gone"
                );
            }
        }
    }

    /// Reject the call, e.g. on client shutdown.
    pub(crate) fn reject(&self, error: MeshError) {
        self.complete(Err(error));
    }
}

/// Monotonic correlation-id source, unique per client.
#[derive(Debug)]
pub(crate) struct RequestIdFactory {
    next_id: Cell<u64>,
}

impl RequestIdFactory {
    pub(crate) fn new() -> Self {
        Self {
            next_id: Cell::new(1),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall::new("query", tx);

        assert!(!call.is_completed());
        call.complete(Ok(json!(1)));
        assert!(call.is_completed());

        // Second completion is ignored; the first wins.
        call.complete(Ok(json!(2)));
        call.reject(MeshError::InvokeTimeout);

        let delivered = rx.await.unwrap().unwrap();
        assert_eq!(delivered, json!(1));
    }

    #[tokio::test]
    async fn test_reject_delivers_error() {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall::new("query", tx);

        call.reject(MeshError::Shutdown);
        assert!(matches!(rx.await.unwrap(), Err(MeshError::Shutdown)));
    }

    #[test]
    fn test_complete_with_caller_gone_does_not_panic() {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall::new("query", tx);
        drop(rx);
        call.complete(Ok(json!(null)));
        assert!(call.is_completed());
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let factory = RequestIdFactory::new();
        assert_eq!(factory.next(), 1);
        assert_eq!(factory.next(), 2);
        assert_eq!(factory.next(), 3);
    }
}
