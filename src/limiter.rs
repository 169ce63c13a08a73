//! The limiter facade: the serializing queue every outbound request flows
//! through.

use crate::bucket::{BucketSnapshot, Token};
use crate::clock::{Clock, TokioClock};
use crate::connector::{ApiRequest, ApiResponse, Connector, MaxDelay};
use crate::error::RateLimitError;
use crate::registry::Registry;
use crate::route::FormattedRoute;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// State shared between the facade and every bucket worker.
pub(crate) struct Shared<C: Connector> {
    pub(crate) connector: C,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) max_delay: MaxDelay,
    pub(crate) registry: Registry<C>,
}

/// Client-side rate limiter for a bucket-limited REST API.
///
/// Submitted requests are queued per bucket and dispatched in submission
/// order, never more than one in flight per bucket, waiting out local quota
/// and global lockouts as response headers dictate. Bucket identities are
/// discovered lazily from `X-RateLimit-Bucket`; until a route's hash is
/// known its requests run under a provisional bucket that is folded into the
/// real one on discovery.
///
/// Buckets and their worker tasks live until [`shutdown`](Self::shutdown).
pub struct RateLimiter<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for RateLimiter<C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<C: Connector> RateLimiter<C> {
    /// A limiter over `connector` with default configuration: no delay cap,
    /// tokio clock.
    pub fn new(connector: C) -> Self {
        Self::builder(connector).build()
    }

    pub fn builder(connector: C) -> RateLimiterBuilder<C> {
        RateLimiterBuilder {
            connector,
            clock: Arc::new(TokioClock),
            max_delay: MaxDelay::Unlimited,
        }
    }

    /// Submit a request and await its response.
    ///
    /// Resolves the request's bucket (creating it if needed), queues the
    /// request, and completes when the bucket worker has dispatched it and a
    /// response or terminal error is available. Retroactive bucket-scoped
    /// 429s are replayed transparently and never surface here.
    ///
    /// Cancelling `cancel` aborts any quota wait and any in-flight dispatch
    /// and completes the call with [`RateLimitError::Cancelled`].
    pub async fn execute(
        &self,
        request: ApiRequest<C::Payload>,
        cancel: CancellationToken,
    ) -> Result<ApiResponse, RateLimitError> {
        let Some(bucket) = self.shared.registry.resolve_or_create(&self.shared, &request.route)
        else {
            return Err(RateLimitError::Shutdown);
        };

        let (done, completion) = oneshot::channel();
        let token = Token { request, cancel: cancel.clone(), done };
        if bucket.queue.send(token).is_err() {
            return Err(RateLimitError::Shutdown);
        }

        tokio::select! {
            biased;
            result = completion => match result {
                Ok(result) => result,
                // Worker dropped the token: it observed our cancellation.
                Err(_) => Err(RateLimitError::Cancelled),
            },
            () = cancel.cancelled() => Err(RateLimitError::Cancelled),
        }
    }

    /// Whether dispatching would currently wait.
    ///
    /// With no route, reports the global lockout; with one, whether its
    /// bucket exists with no remaining quota. Read-only; never creates
    /// buckets.
    pub fn is_rate_limited(&self, route: Option<&FormattedRoute>) -> bool {
        self.shared.registry.is_rate_limited(route, self.shared.clock.now())
    }

    /// Quota counters for `route`'s bucket, if one exists.
    pub fn bucket_snapshot(&self, route: &FormattedRoute) -> Option<BucketSnapshot> {
        self.shared.registry.snapshot(route, self.shared.clock.now())
    }

    /// Stop accepting submissions, let every bucket worker drain its queue,
    /// and wait for them to exit.
    pub async fn shutdown(&self) {
        let workers = self.shared.registry.begin_shutdown();
        let _ = futures::future::join_all(workers).await;
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder<C: Connector> {
    connector: C,
    clock: Arc<dyn Clock>,
    max_delay: MaxDelay,
}

impl<C: Connector> RateLimiterBuilder<C> {
    /// Cap how long any request may wait for quota before being refused
    /// with [`RateLimitError::MaxDelayExceeded`]. Defaults to
    /// [`MaxDelay::Unlimited`]. Per-request options override this.
    pub fn max_delay(mut self, max_delay: MaxDelay) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Replace the time source, e.g. with a
    /// [`TrackingClock`](crate::clock::TrackingClock) in tests.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> RateLimiter<C> {
        RateLimiter {
            shared: Arc::new(Shared {
                connector: self.connector,
                clock: self.clock,
                max_delay: self.max_delay,
                registry: Registry::new(),
            }),
        }
    }
}
