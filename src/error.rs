//! Error type surfaced by the gate middleware
use crate::detector::BlockReason;
use std::fmt;
use std::time::Duration;

/// Error returned by the rate-limit middleware around a wrapped service.
#[derive(Debug, Clone)]
pub enum GateError<E> {
    /// The request was refused by the limiter
    RateLimited {
        /// How long the caller should wait before retrying
        wait: Duration,
        /// Set when the refusal came from a block rather than an empty bucket
        reason: Option<BlockReason>,
    },
    /// The underlying service failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { wait, reason: Some(reason) } => {
                write!(f, "request blocked ({}); retry after {:?}", reason, wait)
            }
            Self::RateLimited { wait, reason: None } => {
                write!(f, "rate limit exceeded; retry after {:?}", wait)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> GateError<E> {
    /// Check if this error is a limiter refusal
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error wraps an inner error
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Suggested wait before retrying, if this is a refusal.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait, .. } => Some(*wait),
            _ => None,
        }
    }

    /// Suggested `Retry-After` header value in whole seconds, rounded up so
    /// a retry at the stated time cannot land early.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after().map(|wait| {
            let secs = wait.as_secs();
            if wait.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
        })
    }

    /// Block reason, if the refusal came from the deny-list or detector.
    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            Self::RateLimited { reason, .. } => *reason,
            _ => None,
        }
    }
}
