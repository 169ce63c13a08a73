//! Shared test harness: a connector that replays a scripted sequence of
//! responses and records every dispatch.

use async_trait::async_trait;
use floodgate::{
    ApiRequest, ApiResponse, BaseRoute, BoxError, Connector, FormattedRoute, MajorParams,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One scripted reply.
pub enum Reply {
    Respond(ApiResponse),
    Fail(&'static str),
    /// Block until the request's cancellation token fires, then error.
    HangUntilCancelled,
}

/// Connector that pops one [`Reply`] per dispatch, recording the request
/// label, the dispatch instant, and the peak number of concurrent calls.
/// Clones share state, so tests keep one clone for assertions.
#[derive(Clone)]
pub struct ScriptedConnector {
    inner: Arc<Inner>,
}

struct Inner {
    script: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<(String, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(script: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Labels of every dispatch, in invocation order.
    pub fn labels(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().iter().map(|(label, _)| label.clone()).collect()
    }

    /// Instants of every dispatch, in invocation order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.inner.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn call_count(&self) -> usize {
        self.inner.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Payload = String;

    async fn send(
        &self,
        request: &ApiRequest<String>,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, BoxError> {
        let concurrent = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
        self.inner.calls.lock().unwrap().push((request.payload.clone(), Instant::now()));

        let reply = self.inner.script.lock().unwrap().pop_front().expect("script exhausted");
        let result = match reply {
            Reply::Respond(response) => Ok(response),
            Reply::Fail(message) => {
                Err(Box::new(std::io::Error::new(std::io::ErrorKind::ConnectionReset, message))
                    as BoxError)
            }
            Reply::HangUntilCancelled => {
                cancel.cancelled().await;
                Err("connection aborted".into())
            }
        };
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.append(*name, HeaderValue::from_str(value).unwrap());
    }
    map
}

/// 200 with a full set of bucket headers.
pub fn ok(bucket: &str, limit: u64, remaining: u64, reset_after: f64) -> Reply {
    Reply::Respond(ApiResponse::new(
        StatusCode::OK,
        headers(&[
            ("x-ratelimit-bucket", bucket.to_owned()),
            ("x-ratelimit-limit", limit.to_string()),
            ("x-ratelimit-remaining", remaining.to_string()),
            ("x-ratelimit-reset-after", reset_after.to_string()),
            ("via", "1.1 proxy".to_owned()),
        ]),
    ))
}

/// 204 with no rate-limit headers at all.
pub fn no_content() -> Reply {
    Reply::Respond(ApiResponse::new(StatusCode::NO_CONTENT, HeaderMap::new()))
}

/// Bucket-scoped 429: proxied, not global.
pub fn limited(retry_after: f64, scope: &str) -> Reply {
    Reply::Respond(ApiResponse::new(
        StatusCode::TOO_MANY_REQUESTS,
        headers(&[
            ("retry-after", retry_after.to_string()),
            ("x-ratelimit-scope", scope.to_owned()),
            ("via", "1.1 proxy".to_owned()),
        ]),
    ))
}

/// Global 429: proxied, `X-RateLimit-Global: true`.
pub fn limited_global(retry_after: f64) -> Reply {
    Reply::Respond(ApiResponse::new(
        StatusCode::TOO_MANY_REQUESTS,
        headers(&[
            ("retry-after", retry_after.to_string()),
            ("x-ratelimit-global", "true".to_owned()),
            ("x-ratelimit-scope", "global".to_owned()),
            ("via", "1.1 proxy".to_owned()),
        ]),
    ))
}

/// Edge 429: no `Via` header, so it never passed the platform's proxy.
pub fn limited_edge(retry_after: f64) -> Reply {
    Reply::Respond(ApiResponse::new(
        StatusCode::TOO_MANY_REQUESTS,
        headers(&[("retry-after", retry_after.to_string())]),
    ))
}

pub fn channel_messages(channel: u64) -> FormattedRoute {
    FormattedRoute::new(
        BaseRoute::new(Method::GET, "/channels/{channel}/messages"),
        MajorParams::channel(channel),
    )
}

pub fn guild_info(guild: u64) -> FormattedRoute {
    FormattedRoute::new(BaseRoute::new(Method::GET, "/guilds/{guild}"), MajorParams::guild(guild))
}

pub fn req(route: FormattedRoute, label: &str) -> ApiRequest<String> {
    ApiRequest::new(route, label.to_owned())
}
