//! The outcome of a single admission check.

use std::time::Duration;

/// `X-RateLimit-Limit` header name.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// `X-RateLimit-Remaining` header name.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// `X-RateLimit-Reset` header name (Unix timestamp, seconds).
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// `Retry-After` header name (seconds).
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Result of a rate limit check. Produced fresh per call, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Whole tokens left after this check.
    pub remaining: u64,
    /// Bucket capacity.
    pub limit: u64,
    /// Wait until one token is available. Zero iff `allowed`.
    pub retry_after: Duration,
    /// Key the check was made against.
    pub key: String,
    /// Route the policy was resolved for, when the check came from a request.
    pub route: Option<String>,
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Decision for a route whose policy is disabled; never touches a store.
    pub(crate) fn unlimited(key: String, capacity: u64) -> Self {
        Self {
            allowed: true,
            remaining: capacity,
            limit: capacity,
            retry_after: Duration::ZERO,
            key,
            route: None,
        }
    }

    /// `Retry-After` value in whole seconds: rounded to nearest, at least 1 for denials.
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        (self.retry_after.as_secs_f64().round() as u64).max(1)
    }

    /// Standard rate limit headers for this decision.
    ///
    /// Reset and `Retry-After` are only emitted for denials. `now_unix_secs` anchors the
    /// reset timestamp.
    pub fn rate_limit_headers(&self, now_unix_secs: u64) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
        ];
        if !self.allowed {
            let reset = now_unix_secs.saturating_add(self.retry_after.as_secs_f64().ceil() as u64);
            headers.push((HEADER_RESET, reset.to_string()));
            headers.push((HEADER_RETRY_AFTER, self.retry_after_secs().to_string()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denied(wait: Duration) -> Decision {
        Decision {
            allowed: false,
            remaining: 0,
            limit: 10,
            retry_after: wait,
            key: "ip:203.0.113.1".into(),
            route: None,
        }
    }

    #[test]
    fn allowed_headers_omit_reset() {
        let d = Decision::unlimited("k".into(), 5);
        let headers = d.rate_limit_headers(1_000);
        assert_eq!(headers, vec![(HEADER_LIMIT, "5".to_string()), (HEADER_REMAINING, "5".to_string())]);
        assert_eq!(d.retry_after_secs(), 0);
    }

    #[test]
    fn denied_headers_include_reset_and_retry_after() {
        let headers = denied(Duration::from_millis(2_400)).rate_limit_headers(1_000);
        assert!(headers.contains(&(HEADER_RESET, "1003".to_string())));
        assert!(headers.contains(&(HEADER_RETRY_AFTER, "2".to_string())));
    }

    #[test]
    fn short_waits_round_up_to_one_second() {
        assert_eq!(denied(Duration::from_millis(200)).retry_after_secs(), 1);
        assert_eq!(denied(Duration::from_millis(1_600)).retry_after_secs(), 2);
    }
}
