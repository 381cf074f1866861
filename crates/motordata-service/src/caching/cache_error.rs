use std::time::Duration;

use thiserror::Error;

/// An error that happens when looking up vehicle data from an upstream API.
///
/// This is the only error type callers of the lookup layer ever observe.
/// Failures inside the cache subsystem itself are logged and swallowed, they
/// never surface as one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The upstream has no data for the requested vehicle.
    #[error("not found")]
    NotFound,
    /// The request was rejected as invalid before or by the upstream.
    ///
    /// The attached string contains the upstream's error message when one
    /// was provided.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The upstream rejected the request due to missing permissions.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The request did not complete within the configured deadline.
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    /// The request failed due to a connection problem, DNS resolution, or a
    /// 5xx server response.
    ///
    /// The attached string contains the root cause or the server's status
    /// line.
    #[error("lookup failed: {0}")]
    Upstream(String),
    /// The upstream responded successfully, but the body was not usable.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The caller canceled the lookup.
    #[error("canceled")]
    Canceled,
    /// An unexpected error in the service itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Whether a retry of the failed operation has a chance of succeeding.
    ///
    /// Client errors, cancellation and malformed payloads are terminal; it
    /// is highly unlikely we get a different result when repeating those.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Timeout(_))
    }
}

/// The outcome of a lookup, either the data or the reason it is unavailable.
pub type CacheContents<T = ()> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::Upstream("503 Service Unavailable".into()).is_transient());
        assert!(CacheError::Timeout(Duration::from_secs(30)).is_transient());

        assert!(!CacheError::NotFound.is_transient());
        assert!(!CacheError::BadRequest("missing model".into()).is_transient());
        assert!(!CacheError::PermissionDenied("401".into()).is_transient());
        assert!(!CacheError::Malformed("unexpected EOF".into()).is_transient());
        assert!(!CacheError::Canceled.is_transient());
        assert!(!CacheError::InternalError.is_transient());
    }

    #[test]
    fn test_display_is_user_facing() {
        let err = CacheError::BadRequest("vehicle make and model are required".into());
        assert_eq!(err.to_string(), "bad request: vehicle make and model are required");
        assert_eq!(CacheError::NotFound.to_string(), "not found");
    }
}
