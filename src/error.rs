//! Error type for submitted requests.

use crate::connector::BoxError;
use std::fmt;
use std::time::Duration;

/// Why a submitted request completed without a response.
///
/// A bucket-scoped 429 is not an error: the limiter absorbs it with an
/// automatic replay. These variants are the cases that reach the caller.
#[derive(Debug)]
pub enum RateLimitError {
    /// The wait required to satisfy quota exceeded the effective cap.
    ///
    /// Evaluated before sleeping; the request was never dispatched.
    MaxDelayExceeded {
        /// The wait that would have been required.
        delay: Duration,
        /// Whether the wait was imposed by the global lockout rather than
        /// the request's own bucket.
        global: bool,
    },
    /// The request's cancellation signal fired.
    Cancelled,
    /// The limiter was shut down before the request could be accepted.
    Shutdown,
    /// The HTTP collaborator failed; the inner error is passed through
    /// untouched.
    Transport(BoxError),
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxDelayExceeded { delay, global: true } => {
                write!(f, "globally rate limited for {:?}, longer than the configured cap", delay)
            }
            Self::MaxDelayExceeded { delay, global: false } => {
                write!(f, "rate limited for {:?}, longer than the configured cap", delay)
            }
            Self::Cancelled => write!(f, "request cancelled"),
            Self::Shutdown => write!(f, "rate limiter shut down"),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RateLimitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => {
                let source: &(dyn std::error::Error + 'static) = e.as_ref();
                Some(source)
            }
            _ => None,
        }
    }
}

impl RateLimitError {
    /// Check if this is a max-delay refusal.
    pub fn is_max_delay_exceeded(&self) -> bool {
        matches!(self, Self::MaxDelayExceeded { .. })
    }

    /// Check if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this is a post-shutdown rejection.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Check if this wraps a transport error.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Access max-delay details as `(delay, global)` if present.
    pub fn max_delay_details(&self) -> Option<(Duration, bool)> {
        match self {
            Self::MaxDelayExceeded { delay, global } => Some((*delay, *global)),
            _ => None,
        }
    }

    /// Take the transport error back out, if this is one.
    pub fn into_transport(self) -> Option<BoxError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}
