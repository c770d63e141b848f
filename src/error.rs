//! Error types for buckets, stores, and the limiter.
use std::error::Error as StdError;

/// Boxed error produced by a pluggable store backend.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Unified error type for all rate limiting operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RateLimitError {
    /// Bucket capacity must be > 0.
    #[error("bucket capacity must be positive (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: u64,
    },
    /// Refill rate must be finite and > 0.
    #[error("refill rate must be positive (got {provided})")]
    InvalidRefillRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Any other configuration problem (bad YAML, unknown extractor, malformed duration).
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Human readable description.
        reason: String,
    },
    /// The rate limit key was empty.
    #[error("rate limit key cannot be empty")]
    InvalidKey,
    /// A key extractor could not produce a key for the request.
    #[error("failed to extract key from request: {reason}")]
    KeyExtractionFailed {
        /// Why extraction failed.
        reason: String,
    },
    /// A store backend failed unexpectedly.
    #[error("store operation failed: {source}")]
    StoreFailed {
        /// Underlying backend error.
        #[source]
        source: BoxError,
    },
}

impl RateLimitError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig { reason: reason.into() }
    }

    pub(crate) fn extraction(reason: impl Into<String>) -> Self {
        Self::KeyExtractionFailed { reason: reason.into() }
    }

    /// Wrap a backend failure. Intended for third-party [`BucketStore`](crate::store::BucketStore)
    /// implementations.
    pub fn store<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::StoreFailed { source: source.into() }
    }

    /// Check if this error was raised while validating configuration.
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidCapacity { .. } | Self::InvalidRefillRate { .. } | Self::InvalidConfig { .. }
        )
    }

    /// Check if this error is due to an empty key.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey)
    }

    /// Check if this error came from key extraction.
    pub fn is_key_extraction(&self) -> bool {
        matches!(self, Self::KeyExtractionFailed { .. })
    }

    /// Check if this error wraps a backend failure.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreFailed { .. })
    }
}
