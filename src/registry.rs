//! The bucket registry and limiter-wide rate-limit state.
//!
//! One coarse mutex guards the route→hash map, the key→bucket map, the
//! global lockout instant, and the set of routes seen to 429. Every hold is
//! O(1); contention is negligible because updates are bursty.

use crate::bucket::{self, BucketHandle, BucketSnapshot, BucketState};
use crate::connector::{ApiResponse, Connector};
use crate::headers::{RateLimitHeaders, Scope};
use crate::limiter::Shared;
use crate::route::{BaseRoute, FormattedRoute};
use http::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A first 429 on a route with a backoff under this counts as routine and
/// logs at info; anything longer, or a repeat offender, logs at warn.
const SHORT_RETRY: Duration = Duration::from_secs(10);

pub(crate) struct Registry<C: Connector> {
    state: Mutex<RegistryState<C>>,
}

struct RegistryState<C: Connector> {
    /// Server-assigned hashes, learned from response headers. First hash
    /// wins for the life of the limiter.
    hashes: HashMap<BaseRoute, String>,
    buckets: HashMap<String, BucketHandle<C::Payload>>,
    workers: Vec<JoinHandle<()>>,
    global_resets_at: Option<Instant>,
    /// Routes that have 429'd at least once; drives log severity only.
    hit_routes: HashSet<BaseRoute>,
    shutdown: bool,
}

impl<C: Connector> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> Registry<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                hashes: HashMap::new(),
                buckets: HashMap::new(),
                workers: Vec::new(),
                global_resets_at: None,
                hit_routes: HashSet::new(),
                shutdown: false,
            }),
        }
    }

    /// The bucket `route` currently resolves to, if one exists. Never
    /// creates; this is the lookup workers use for migration checks and the
    /// probes use for reads.
    pub fn resolve(&self, route: &FormattedRoute) -> Option<BucketHandle<C::Payload>> {
        let state = self.state.lock().unwrap();
        state.buckets.get(&state.key_for(route)).cloned()
    }

    /// The bucket `route` resolves to, created provisionally if absent.
    /// Returns `None` only after shutdown.
    pub fn resolve_or_create(
        &self,
        shared: &Arc<Shared<C>>,
        route: &FormattedRoute,
    ) -> Option<BucketHandle<C::Payload>> {
        let now = shared.clock.now();
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return None;
        }
        let provisional = !state.hashes.contains_key(route.base());
        let key = state.key_for(route);
        state.bucket_entry(shared, key, provisional, now)
    }

    /// How long the worker for `bucket` must wait before dispatching, and
    /// whether the wait is imposed by the global lockout.
    pub fn required_delay(&self, bucket: &BucketState, now: Instant) -> (Duration, bool) {
        let global_resets_at = self.state.lock().unwrap().global_resets_at;
        if let Some(at) = global_resets_at {
            if at > now {
                return (at - now, true);
            }
        }
        let counters = bucket.counters();
        if counters.remaining == 0 {
            (counters.resets_at.saturating_duration_since(now), false)
        } else {
            (Duration::ZERO, false)
        }
    }

    /// Interpret a response's rate-limit headers.
    ///
    /// Learns the bucket hash if it is new, records global and edge
    /// lockouts, and updates quota counters on the bucket the route resolves
    /// to after any discovery. Returns `true` iff the response was a
    /// retryable bucket-scoped 429 and the worker should replay the token.
    pub fn update_from_response(
        &self,
        shared: &Arc<Shared<C>>,
        route: &FormattedRoute,
        executing: &Arc<BucketState>,
        response: &ApiResponse,
    ) -> bool {
        let parsed = match RateLimitHeaders::parse(&response.headers) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::error!(route = %route, %error, "ignoring unreadable rate limit headers");
                return false;
            }
        };

        let now = shared.clock.now();
        let mut state = self.state.lock().unwrap();

        if let Some(hash) = parsed.bucket.as_deref() {
            state.learn_hash(route.base(), hash);
        }

        // Accounting applies to whatever bucket the route resolves to now:
        // the real bucket once the hash is known (created here on first
        // discovery, so queued tokens can migrate into it), otherwise the
        // provisional bucket that dispatched the request.
        let target = match state.hashes.get(route.base()).cloned() {
            Some(hash) => {
                let key = route.bucket_key(&hash);
                match state.bucket_entry(shared, key, false, now) {
                    Some(handle) => handle.state,
                    None => Arc::clone(executing),
                }
            }
            None => Arc::clone(executing),
        };

        if response.status == StatusCode::TOO_MANY_REQUESTS {
            let Some(retry_after) = parsed.retry_after else {
                tracing::error!(route = %route, "429 without a Retry-After header");
                return false;
            };
            if parsed.global || !parsed.proxied {
                // Global and edge lockouts collapse into one instant; every
                // worker's pre-dispatch check picks it up, so no replay is
                // scheduled here.
                state.global_resets_at = Some(now + retry_after);
                tracing::warn!(
                    route = %route,
                    ?retry_after,
                    edge = !parsed.proxied,
                    "global rate limit hit"
                );
                return false;
            }

            target.note_limited(retry_after, now);
            let first_hit = state.hit_routes.insert(route.base().clone());
            if parsed.scope == Some(Scope::Shared) || (first_hit && retry_after < SHORT_RETRY) {
                tracing::info!(
                    bucket = %target.key,
                    ?retry_after,
                    scope = ?parsed.scope,
                    "bucket rate limit hit"
                );
            } else {
                tracing::warn!(
                    bucket = %target.key,
                    ?retry_after,
                    scope = ?parsed.scope,
                    "bucket rate limit hit"
                );
            }
            return true;
        }

        if parsed.has_bucket_update() {
            target.apply_update(parsed.limit, parsed.remaining, parsed.reset_after, now);
            tracing::trace!(
                bucket = %target.key,
                limit = ?parsed.limit,
                remaining = ?parsed.remaining,
                reset_after = ?parsed.reset_after,
                "bucket quota updated"
            );
        }
        false
    }

    /// Probe. Without a route: is the global lockout active. With one: does
    /// its bucket exist with no remaining quota. Never creates buckets.
    pub fn is_rate_limited(&self, route: Option<&FormattedRoute>, now: Instant) -> bool {
        let state = self.state.lock().unwrap();
        match route {
            None => state.global_resets_at.is_some_and(|at| at > now),
            Some(route) => state
                .buckets
                .get(&state.key_for(route))
                .is_some_and(|bucket| bucket.state.counters().remaining == 0),
        }
    }

    pub fn snapshot(&self, route: &FormattedRoute, now: Instant) -> Option<BucketSnapshot> {
        self.resolve(route).map(|bucket| bucket.state.snapshot(now))
    }

    /// Stop accepting submissions and drop every queue sender, letting the
    /// workers drain what remains and exit. Returns their join handles.
    pub fn begin_shutdown(&self) -> Vec<JoinHandle<()>> {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        state.buckets.clear();
        std::mem::take(&mut state.workers)
    }
}

impl<C: Connector> RegistryState<C> {
    fn key_for(&self, route: &FormattedRoute) -> String {
        match self.hashes.get(route.base()) {
            Some(hash) => route.bucket_key(hash),
            None => route.bucket_key(&route.synthetic_hash()),
        }
    }

    /// First observed hash for a base route wins; later conflicting hashes
    /// are logged and ignored.
    fn learn_hash(&mut self, base: &BaseRoute, hash: &str) {
        match self.hashes.get(base) {
            None => {
                tracing::debug!(route = %base, hash, "discovered bucket hash");
                self.hashes.insert(base.clone(), hash.to_owned());
            }
            Some(known) if known != hash => {
                tracing::warn!(route = %base, %known, observed = hash, "conflicting bucket hash ignored");
            }
            Some(_) => {}
        }
    }

    /// Look up or create the bucket under `key`, spawning its worker. After
    /// shutdown only lookups remain.
    fn bucket_entry(
        &mut self,
        shared: &Arc<Shared<C>>,
        key: String,
        provisional: bool,
        now: Instant,
    ) -> Option<BucketHandle<C::Payload>> {
        if let Some(handle) = self.buckets.get(&key) {
            return Some(handle.clone());
        }
        if self.shutdown {
            return None;
        }
        let (queue, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(BucketState::new(key.clone(), provisional, now));
        let handle = BucketHandle { state: Arc::clone(&state), queue };
        tracing::trace!(bucket = %key, provisional, "created bucket");
        self.workers.push(tokio::spawn(bucket::run(Arc::clone(shared), state, receiver)));
        self.buckets.insert(key, handle.clone());
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::connector::{ApiRequest, BoxError, MaxDelay};
    use crate::route::MajorParams;
    use async_trait::async_trait;
    use http::{HeaderMap, HeaderValue, Method};
    use tokio_util::sync::CancellationToken;

    struct NullConnector;

    #[async_trait]
    impl Connector for NullConnector {
        type Payload = ();

        async fn send(
            &self,
            _request: &ApiRequest<()>,
            _cancel: &CancellationToken,
        ) -> Result<ApiResponse, BoxError> {
            Ok(ApiResponse::new(StatusCode::NO_CONTENT, HeaderMap::new()))
        }
    }

    fn shared() -> Arc<Shared<NullConnector>> {
        Arc::new(Shared {
            connector: NullConnector,
            clock: Arc::new(TokioClock),
            max_delay: MaxDelay::Unlimited,
            registry: Registry::new(),
        })
    }

    fn route() -> FormattedRoute {
        FormattedRoute::new(
            BaseRoute::new(Method::GET, "/channels/{channel}/messages"),
            MajorParams::channel(42),
        )
    }

    fn response(status: StatusCode, pairs: &[(&'static str, &str)]) -> ApiResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_str(value).unwrap());
        }
        ApiResponse::new(status, headers)
    }

    #[tokio::test]
    async fn unknown_route_gets_a_provisional_bucket() {
        let shared = shared();
        let bucket = shared.registry.resolve_or_create(&shared, &route()).unwrap();
        assert!(bucket.state.provisional);
        assert!(bucket.state.key.starts_with("unlimited+"));
    }

    #[tokio::test]
    async fn discovery_rekeys_the_route_to_the_real_bucket() {
        let shared = shared();
        let provisional = shared.registry.resolve_or_create(&shared, &route()).unwrap();

        let replay = shared.registry.update_from_response(
            &shared,
            &route(),
            &provisional.state,
            &response(
                StatusCode::OK,
                &[
                    ("x-ratelimit-bucket", "abc"),
                    ("x-ratelimit-limit", "5"),
                    ("x-ratelimit-remaining", "4"),
                    ("x-ratelimit-reset-after", "1.0"),
                ],
            ),
        );
        assert!(!replay);

        let real = shared.registry.resolve(&route()).unwrap();
        assert!(!real.state.provisional);
        assert_eq!(real.state.key, "abc::42:");
        let counters = real.state.counters();
        assert_eq!((counters.limit, counters.remaining), (5, 4));
        // The provisional bucket was left untouched.
        assert_eq!(provisional.state.counters().remaining, 1);
    }

    #[tokio::test]
    async fn first_hash_wins_over_conflicting_ones() {
        let shared = shared();
        let bucket = shared.registry.resolve_or_create(&shared, &route()).unwrap();

        for hash in ["abc", "def"] {
            shared.registry.update_from_response(
                &shared,
                &route(),
                &bucket.state,
                &response(StatusCode::OK, &[("x-ratelimit-bucket", hash)]),
            );
        }

        assert_eq!(shared.registry.resolve(&route()).unwrap().state.key, "abc::42:");
    }

    #[tokio::test]
    async fn scoped_429_zeroes_quota_and_requests_replay() {
        let shared = shared();
        let bucket = shared.registry.resolve_or_create(&shared, &route()).unwrap();

        let replay = shared.registry.update_from_response(
            &shared,
            &route(),
            &bucket.state,
            &response(
                StatusCode::TOO_MANY_REQUESTS,
                &[
                    ("retry-after", "0.5"),
                    ("x-ratelimit-scope", "user"),
                    ("via", "1.1 proxy"),
                ],
            ),
        );
        assert!(replay);
        let counters = bucket.state.counters();
        assert_eq!(counters.remaining, 0);
        let now = shared.clock.now();
        assert!(shared.registry.required_delay(&bucket.state, now).0 > Duration::ZERO);
    }

    #[tokio::test]
    async fn global_429_locks_every_bucket_without_replay() {
        let shared = shared();
        let bucket = shared.registry.resolve_or_create(&shared, &route()).unwrap();

        let replay = shared.registry.update_from_response(
            &shared,
            &route(),
            &bucket.state,
            &response(
                StatusCode::TOO_MANY_REQUESTS,
                &[
                    ("retry-after", "2.0"),
                    ("x-ratelimit-global", "true"),
                    ("via", "1.1 proxy"),
                ],
            ),
        );
        assert!(!replay);
        assert!(shared.registry.is_rate_limited(None, shared.clock.now()));

        let now = shared.clock.now();
        let (delay, global) = shared.registry.required_delay(&bucket.state, now);
        assert!(global);
        assert!(delay > Duration::from_secs(1));
    }

    #[tokio::test]
    async fn missing_via_on_429_is_an_edge_lockout() {
        let shared = shared();
        let bucket = shared.registry.resolve_or_create(&shared, &route()).unwrap();

        let replay = shared.registry.update_from_response(
            &shared,
            &route(),
            &bucket.state,
            &response(StatusCode::TOO_MANY_REQUESTS, &[("retry-after", "1.0")]),
        );
        assert!(!replay);
        assert!(shared.registry.is_rate_limited(None, shared.clock.now()));
    }

    #[tokio::test]
    async fn unreadable_headers_are_swallowed() {
        let shared = shared();
        let bucket = shared.registry.resolve_or_create(&shared, &route()).unwrap();

        let replay = shared.registry.update_from_response(
            &shared,
            &route(),
            &bucket.state,
            &response(StatusCode::OK, &[("x-ratelimit-remaining", "many")]),
        );
        assert!(!replay);
        assert_eq!(bucket.state.counters().remaining, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_creation_and_clears_buckets() {
        let shared = shared();
        let before = shared.registry.resolve_or_create(&shared, &route()).unwrap();
        drop(before);

        let workers = shared.registry.begin_shutdown();
        assert_eq!(workers.len(), 1);
        assert!(shared.registry.resolve_or_create(&shared, &route()).is_none());
        assert!(shared.registry.resolve(&route()).is_none());
    }
}
