use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CacheConfig;

/// An error that happens when fetching or converting the symbols of a module.
///
/// This error enum is intended for persisting in the cache metadata, except for the
/// [`InternalError`](Self::InternalError) variant.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "details", rename_all = "snake_case")]
pub enum CacheError {
    /// The symbol file was not found on any of the sources.
    #[error("not found")]
    NotFound,
    /// The symbol file could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The symbol file could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(#[serde(with = "humantime_serde")] Duration),
    /// The symbol file could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The symbol file was fetched successfully, but could not be converted.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected local error, such as a full disk.
    ///
    /// This variant is not intended to be persisted to or read from the cache.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub(crate) fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// How long this error is remembered before the module is fetched again.
    ///
    /// Returns `None` for errors that must not be persisted at all.
    pub fn retry_after(&self, config: &CacheConfig) -> Option<Duration> {
        match self {
            Self::NotFound => Some(config.retry_misses_after),
            Self::Malformed(_) => Some(config.retry_malformed_after),
            Self::PermissionDenied(_) | Self::Timeout(_) | Self::DownloadError(_) => {
                Some(config.retry_failed_after)
            }
            Self::InternalError => None,
        }
    }

    /// Whether this error is worth retrying against the same file right away.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::DownloadError(_))
    }

    /// A short, static name of the variant, used for metrics and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internalerror",
        }
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the reason why an
/// object could not be fetched or is otherwise unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_form() {
        let json = serde_json::to_string(&CacheError::Timeout(Duration::from_secs(90))).unwrap();
        assert_eq!(json, r#"{"kind":"timeout","details":"1m 30s"}"#);

        let json = serde_json::to_string(&CacheError::NotFound).unwrap();
        assert_eq!(json, r#"{"kind":"not_found"}"#);

        for err in [
            CacheError::NotFound,
            CacheError::PermissionDenied("403 Forbidden".into()),
            CacheError::Timeout(Duration::from_millis(1500)),
            CacheError::DownloadError("connection reset".into()),
            CacheError::Malformed("unknown file format".into()),
        ] {
            let json = serde_json::to_string(&err).unwrap();
            let parsed: CacheError = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, err);
        }
    }

    #[test]
    fn test_retry_after() {
        let config = CacheConfig::default();
        assert_eq!(
            CacheError::NotFound.retry_after(&config),
            Some(config.retry_misses_after)
        );
        assert_eq!(
            CacheError::Malformed("x".into()).retry_after(&config),
            Some(config.retry_malformed_after)
        );
        assert_eq!(
            CacheError::DownloadError("x".into()).retry_after(&config),
            Some(config.retry_failed_after)
        );
        assert_eq!(CacheError::InternalError.retry_after(&config), None);
    }
}
