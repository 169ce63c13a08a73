#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Client-side rate limiting for a bucket-limited REST API: every outbound
//! request flows through a [`RateLimiter`], which queues it on its bucket,
//! waits out quota, and dispatches through your HTTP client.
//!
//! ## Features
//!
//! - **Header-discovered buckets**: bucket identities are learned lazily
//!   from `X-RateLimit-Bucket`; requests on undiscovered routes run under a
//!   provisional bucket that is folded into the real one on discovery
//! - **FIFO per bucket** with at most one request in flight per bucket
//! - **Global and edge lockouts** (`X-RateLimit-Global`, missing `Via`)
//!   observed by every bucket
//! - **Transparent 429 replay**: a retroactive bucket-scoped 429 is replayed
//!   once quota allows, without surfacing to the caller
//! - **Max-delay policy**: refuse, rather than wait, when the required delay
//!   exceeds a limiter-wide or per-request cap
//! - **Prompt cancellation** of queued waits and in-flight dispatches
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{
//!     ApiRequest, ApiResponse, BaseRoute, BoxError, Connector, FormattedRoute,
//!     MajorParams, RateLimiter,
//! };
//! use http::{HeaderMap, Method, StatusCode};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl Connector for Printer {
//!     type Payload = String;
//!
//!     async fn send(
//!         &self,
//!         request: &ApiRequest<String>,
//!         _cancel: &CancellationToken,
//!     ) -> Result<ApiResponse, BoxError> {
//!         println!("dispatching: {}", request.payload);
//!         Ok(ApiResponse::new(StatusCode::NO_CONTENT, HeaderMap::new()))
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let limiter = RateLimiter::new(Printer);
//!
//!     let route = FormattedRoute::new(
//!         BaseRoute::new(Method::GET, "/channels/{channel}/messages"),
//!         MajorParams::channel(42),
//!     );
//!     let response = limiter
//!         .execute(
//!             ApiRequest::new(route, "list messages".to_owned()),
//!             CancellationToken::new(),
//!         )
//!         .await?;
//!     assert_eq!(response.status, StatusCode::NO_CONTENT);
//!
//!     limiter.shutdown().await;
//!     Ok(())
//! }
//! ```

mod bucket;
pub mod clock;
pub mod connector;
pub mod error;
mod headers;
pub mod limiter;
mod registry;
pub mod route;

// Re-exports
pub use bucket::BucketSnapshot;
pub use clock::{Clock, TokioClock, TrackingClock};
pub use connector::{ApiRequest, ApiResponse, BoxError, Connector, MaxDelay, RequestOptions};
pub use error::RateLimitError;
pub use headers::Scope;
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use route::{BaseRoute, FormattedRoute, MajorParams};
