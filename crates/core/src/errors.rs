use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by exchange adapters.
///
/// The transient/permanent split drives retry policy: transient failures are
/// retried with backoff, permanent failures mark the attempt as rejected and
/// are never replayed with the same request.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level or 5xx failure; safe to retry.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// HTTP 429; retry after backing off.
    #[error("rate limited by exchange")]
    RateLimited,

    /// Operation exceeded its deadline.
    #[error("exchange call timed out after {0:?}")]
    Timeout(Duration),

    /// 4xx-class rejection (bad price/size, auth). Do not retry.
    #[error("permanent exchange error: {0}")]
    Permanent(String),

    /// The referenced order does not exist on the exchange.
    #[error("order not found: {0}")]
    OrderNotFound(String),
}

impl ExchangeError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited | Self::Timeout(_)
        )
    }

    /// Classifies an HTTP status code per the retry policy.
    #[must_use]
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited,
            500..=599 => Self::Transient(format!("HTTP {status}: {body}")),
            _ => Self::Permanent(format!("HTTP {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert!(ExchangeError::from_status(429, String::new()).is_transient());
        assert!(ExchangeError::from_status(503, String::new()).is_transient());
        assert!(!ExchangeError::from_status(400, String::new()).is_transient());
        assert!(!ExchangeError::from_status(403, String::new()).is_transient());
    }

    #[test]
    fn timeout_is_transient() {
        assert!(ExchangeError::Timeout(Duration::from_secs(10)).is_transient());
    }
}
