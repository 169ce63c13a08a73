//! Per-bucket state and the single-consumer worker that drains it.
//!
//! Every bucket owns one long-lived task. The task dequeues tokens in
//! submission order, waits out local or global quota, dispatches through the
//! connector, and feeds response headers back into the registry. Keeping the
//! queue single-consumer is what makes the FIFO and migration guarantees
//! hold.

use crate::connector::{ApiRequest, ApiResponse, Connector};
use crate::error::RateLimitError;
use crate::limiter::Shared;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Mutable quota counters, written only by the registry while interpreting a
/// response, read by the owning worker before each dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Counters {
    pub limit: u64,
    pub remaining: u64,
    pub resets_at: Instant,
}

/// One bucket's shared state. The queue sender lives in the registry; the
/// receiver is owned by the worker task.
#[derive(Debug)]
pub(crate) struct BucketState {
    pub key: String,
    /// True while the bucket is keyed by a synthetic hash. A provisional
    /// bucket's worker re-resolves the route before every dispatch and hands
    /// its tokens over once the real bucket exists.
    pub provisional: bool,
    counters: Mutex<Counters>,
}

impl BucketState {
    pub fn new(key: String, provisional: bool, now: Instant) -> Self {
        Self {
            key,
            provisional,
            counters: Mutex::new(Counters { limit: 1, remaining: 1, resets_at: now }),
        }
    }

    pub fn counters(&self) -> Counters {
        *self.counters.lock().unwrap()
    }

    /// Apply `X-RateLimit-{Limit,Remaining,Reset-After}` values.
    pub fn apply_update(
        &self,
        limit: Option<u64>,
        remaining: Option<u64>,
        reset_after: Option<Duration>,
        now: Instant,
    ) {
        let mut counters = self.counters.lock().unwrap();
        if let Some(limit) = limit {
            counters.limit = limit;
        }
        if let Some(remaining) = remaining {
            counters.remaining = remaining;
        }
        if let Some(reset_after) = reset_after {
            counters.resets_at = now + reset_after;
        }
    }

    /// Apply a bucket-scoped 429: quota is spent until `retry_after` passes.
    pub fn note_limited(&self, retry_after: Duration, now: Instant) {
        let mut counters = self.counters.lock().unwrap();
        counters.remaining = 0;
        counters.resets_at = now + retry_after;
    }

    pub fn snapshot(&self, now: Instant) -> BucketSnapshot {
        let counters = self.counters();
        BucketSnapshot {
            limit: counters.limit,
            remaining: counters.remaining,
            resets_in: counters.resets_at.saturating_duration_since(now),
        }
    }
}

/// Read-only view of a bucket's quota, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Requests allotted per reset window.
    pub limit: u64,
    /// Requests still available in the current window.
    pub remaining: u64,
    /// How long until the window refreshes; zero if already refreshed.
    pub resets_in: Duration,
}

/// One submitted request: payload, cancellation signal, and the completion
/// slot the caller is awaiting. Owned by exactly one component at a time:
/// the queue while waiting, the worker while executing.
pub(crate) struct Token<T> {
    pub request: ApiRequest<T>,
    pub cancel: CancellationToken,
    pub done: oneshot::Sender<Result<ApiResponse, RateLimitError>>,
}

impl<T> Token<T> {
    fn complete(self, result: Result<ApiResponse, RateLimitError>) {
        // The caller may have stopped waiting (cancellation); nothing to do.
        let _ = self.done.send(result);
    }
}

/// A bucket as the registry sees it: state plus the queue's send side.
#[derive(Debug)]
pub(crate) struct BucketHandle<T> {
    pub state: Arc<BucketState>,
    pub queue: mpsc::UnboundedSender<Token<T>>,
}

impl<T> Clone for BucketHandle<T> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state), queue: self.queue.clone() }
    }
}

/// The worker task: sole consumer of one bucket's queue.
///
/// Exits when every sender is gone (registry shutdown) and the queue has
/// drained.
pub(crate) async fn run<C: Connector>(
    shared: Arc<Shared<C>>,
    bucket: Arc<BucketState>,
    mut queue: mpsc::UnboundedReceiver<Token<C::Payload>>,
) {
    while let Some(token) = queue.recv().await {
        // Cancelled while queued: skip without consuming quota. The caller
        // already unblocked through its own cancellation branch.
        if token.cancel.is_cancelled() {
            tracing::trace!(bucket = %bucket.key, "dropping cancelled request");
            continue;
        }
        process(&shared, &bucket, token).await;
    }
    tracing::trace!(bucket = %bucket.key, "bucket worker stopped");
}

/// Drive one token to completion, replay, or migration.
async fn process<C: Connector>(
    shared: &Arc<Shared<C>>,
    bucket: &Arc<BucketState>,
    token: Token<C::Payload>,
) {
    loop {
        // Migration: once the real bucket exists, this provisional one hands
        // its tokens over. Re-appending preserves order because nothing
        // after this token has been dequeued yet.
        if bucket.provisional {
            if let Some(dest) = shared.registry.resolve(&token.request.route) {
                if !Arc::ptr_eq(&dest.state, bucket) {
                    tracing::debug!(
                        from = %bucket.key,
                        to = %dest.state.key,
                        "migrating request to discovered bucket"
                    );
                    if let Err(rejected) = dest.queue.send(token) {
                        rejected.0.complete(Err(RateLimitError::Shutdown));
                    }
                    return;
                }
            }
        }

        // Quota: global lockout first, then this bucket's window.
        let now = shared.clock.now();
        let (delay, global) = shared.registry.required_delay(bucket, now);
        if delay > Duration::ZERO {
            let cap = token.request.options.max_delay.unwrap_or(shared.max_delay);
            if !cap.permits(delay) {
                token.complete(Err(RateLimitError::MaxDelayExceeded { delay, global }));
                return;
            }
            if global {
                tracing::info!(bucket = %bucket.key, ?delay, "waiting out global rate limit");
            } else if token.request.route.base().is_create_reaction() {
                tracing::debug!(bucket = %bucket.key, ?delay, "waiting out reaction rate limit");
            } else {
                tracing::info!(bucket = %bucket.key, ?delay, "waiting out bucket rate limit");
            }
            let cancelled = tokio::select! {
                () = shared.clock.sleep_until(now + delay) => false,
                () = token.cancel.cancelled() => true,
            };
            if cancelled {
                token.complete(Err(RateLimitError::Cancelled));
                return;
            }
        }

        // Dispatch, then feed the response back into the registry. A `true`
        // verdict means a retryable bucket-scoped 429: loop and let the
        // quota check above absorb the backoff.
        match shared.connector.send(&token.request, &token.cancel).await {
            Ok(response) => {
                let replay = shared.registry.update_from_response(
                    shared,
                    &token.request.route,
                    bucket,
                    &response,
                );
                if replay {
                    continue;
                }
                token.complete(Ok(response));
                return;
            }
            Err(error) => {
                if token.cancel.is_cancelled() {
                    tracing::debug!(bucket = %bucket.key, "request cancelled mid-dispatch");
                    token.complete(Err(RateLimitError::Cancelled));
                } else {
                    tracing::error!(bucket = %bucket.key, %error, "request dispatch failed");
                    token.complete(Err(RateLimitError::Transport(error)));
                }
                return;
            }
        }
    }
}
