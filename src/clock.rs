//! Time source abstraction.
//!
//! All waits inside the limiter go through a [`Clock`], so tests can observe
//! which delays were requested without coupling to wall time.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Source of now-instants and deadline sleeps.
///
/// Implementations must be safe to share across tasks. `now` must be
/// monotonic; `sleep_until` must resolve no earlier than the deadline for
/// production clocks (test clocks may resolve immediately).
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant.
    fn now(&self) -> Instant;

    /// A future that resolves once `deadline` has passed.
    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}

/// Test clock that records every requested sleep and resolves immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingClock {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations of every sleep requested so far, in request order.
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.slept.lock().unwrap().clear();
    }
}

impl Clock for TrackingClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let requested = deadline.saturating_duration_since(Instant::now());
        self.slept.lock().unwrap().push(requested);
        Box::pin(async {})
    }
}
