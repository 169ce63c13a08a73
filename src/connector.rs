//! The HTTP collaborator seam and the request/response types that cross it.
//!
//! The limiter never builds or sends HTTP itself. Callers hand it an
//! [`ApiRequest`]; when quota allows, the bucket worker invokes the
//! [`Connector`] and interprets the [`ApiResponse`] it returns.

use crate::route::FormattedRoute;
use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Boxed error type carried through from the HTTP collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Executes one HTTP request.
///
/// Implementations wrap whatever HTTP client the application uses. They must
/// abort promptly when `cancel` fires and surface that as an error; the
/// limiter maps it back to a cancelled completion.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The request payload the implementation knows how to send.
    type Payload: Send + Sync + 'static;

    /// Send `request`, honouring `cancel`.
    ///
    /// Called by reference: a request rejected with a retroactive 429 is
    /// replayed with the same payload.
    async fn send(
        &self,
        request: &ApiRequest<Self::Payload>,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, BoxError>;
}

/// Cap on how long a request may voluntarily wait for quota.
///
/// This is a policy refusal, not a timeout: it is evaluated before sleeping,
/// and a request whose wait would exceed the cap fails immediately with
/// [`RateLimitError::MaxDelayExceeded`](crate::RateLimitError::MaxDelayExceeded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxDelay {
    /// Refuse any wait longer than the given duration.
    Finite(Duration),
    /// Wait however long quota demands.
    Unlimited,
}

impl MaxDelay {
    /// Whether a wait of `delay` is within this cap.
    pub fn permits(&self, delay: Duration) -> bool {
        match self {
            Self::Finite(cap) => delay <= *cap,
            Self::Unlimited => true,
        }
    }
}

/// Per-request knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overrides the limiter-wide [`MaxDelay`] for this request only.
    pub max_delay: Option<MaxDelay>,
}

/// One request submitted to the limiter.
#[derive(Debug)]
pub struct ApiRequest<T> {
    /// The route the request targets; determines its bucket.
    pub route: FormattedRoute,
    /// Whatever the [`Connector`] needs to put the request on the wire.
    pub payload: T,
    pub options: RequestOptions,
}

impl<T> ApiRequest<T> {
    pub fn new(route: FormattedRoute, payload: T) -> Self {
        Self { route, payload, options: RequestOptions::default() }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// The slice of an HTTP response the limiter needs: status, headers, body.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self { status, headers, body: Vec::new() }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}
