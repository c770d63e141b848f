//! Limiter configuration: default policy, per-route overrides, key extractor, and idle age.
//!
//! Configuration can be built in code or loaded from YAML:
//!
//! ```yaml
//! defaults:
//!   capacity: 100
//!   refill_rate: 10.0
//! policies:
//!   /api/login:
//!     capacity: 5
//!     refill_rate: 0.1
//!   /healthz:
//!     capacity: 1
//!     refill_rate: 1.0
//!     enabled: false
//! key_extractor: "header:X-API-Key,ip-proxy"
//! cleanup_age: 30m
//! ```

use crate::bucket::BucketConfig;
use crate::key::KeyExtractor;
use crate::RateLimitError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CAPACITY: u64 = 100;
const DEFAULT_REFILL_RATE: f64 = 10.0;
const DEFAULT_KEY_EXTRACTOR: &str = "ip";
const DEFAULT_CLEANUP_AGE: &str = "1h";

fn enabled_by_default() -> bool {
    true
}

/// Rate limit parameters for one route (or the defaults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Burst size.
    pub capacity: u64,
    /// Tokens regained per second.
    pub refill_rate: f64,
    /// Disabled routes are always allowed and never touch the store.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl PolicyConfig {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self { capacity, refill_rate, enabled: true }
    }

    /// A policy that never limits.
    pub fn disabled() -> Self {
        Self { capacity: DEFAULT_CAPACITY, refill_rate: DEFAULT_REFILL_RATE, enabled: false }
    }

    pub fn validate(&self) -> Result<(), RateLimitError> {
        self.to_bucket_config().map(|_| ())
    }

    pub fn to_bucket_config(&self) -> Result<BucketConfig, RateLimitError> {
        BucketConfig::new(self.capacity, self.refill_rate)
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL_RATE)
    }
}

/// Top-level limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Policy for routes without an override.
    pub defaults: PolicyConfig,
    /// Route path → policy override.
    pub policies: HashMap<String, PolicyConfig>,
    /// Key extractor spec, see [`KeyExtractor::parse`].
    pub key_extractor: String,
    /// Idle age before a bucket is evicted, e.g. `"1h"`, `"30m"`; `"0"` disables eviction.
    pub cleanup_age: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            defaults: PolicyConfig::default(),
            policies: HashMap::new(),
            key_extractor: DEFAULT_KEY_EXTRACTOR.to_string(),
            cleanup_age: DEFAULT_CLEANUP_AGE.to_string(),
        }
    }
}

impl LimiterConfig {
    /// Defaults with the given default policy.
    pub fn with_defaults(capacity: u64, refill_rate: f64) -> Result<Self, RateLimitError> {
        let cfg = Self { defaults: PolicyConfig::new(capacity, refill_rate), ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RateLimitError> {
        let cfg: Self = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::config(format!("failed to parse YAML: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse, and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RateLimitError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RateLimitError::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check the default and every route policy.
    ///
    /// The extractor spec and cleanup age are checked where they are parsed, by
    /// [`extractor`](Self::extractor) and [`parsed_cleanup_age`](Self::parsed_cleanup_age),
    /// so a builder override can stand in for either.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        self.defaults.validate()?;
        for (route, policy) in &self.policies {
            policy.validate().map_err(|e| {
                RateLimitError::config(format!("invalid policy for route {route}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Policy for `route`: its override if present, else the defaults.
    pub fn policy_for(&self, route: &str) -> &PolicyConfig {
        self.policies.get(route).unwrap_or(&self.defaults)
    }

    /// Install or replace the policy for `route` after validating it.
    pub fn set_policy(
        &mut self,
        route: impl Into<String>,
        policy: PolicyConfig,
    ) -> Result<Option<PolicyConfig>, RateLimitError> {
        policy.validate()?;
        Ok(self.policies.insert(route.into(), policy))
    }

    /// Parsed key extractor.
    pub fn extractor(&self) -> Result<KeyExtractor, RateLimitError> {
        KeyExtractor::parse(&self.key_extractor)
    }

    /// Parsed cleanup age.
    pub fn parsed_cleanup_age(&self) -> Result<Duration, RateLimitError> {
        parse_duration(&self.cleanup_age)
    }
}

/// Parse a duration such as `"250ms"`, `"1h30m"`, or `"1.5h"`. A bare `"0"` is zero.
///
/// Units: `ns`, `us` (`µs`), `ms`, `s`, `m`, `h`. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, RateLimitError> {
    let s = input.trim();
    let invalid = |why: &str| RateLimitError::config(format!("invalid duration {input:?}: {why}"));

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid("empty"));
    }
    if s.starts_with('-') {
        return Err(invalid("must not be negative"));
    }

    let mut rest = s.strip_prefix('+').unwrap_or(s);
    let mut total_nanos = 0.0_f64;
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if num_end == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..num_end].parse().map_err(|_| invalid("malformed number"))?;
        rest = &rest[num_end..];

        let unit_end = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            "" => return Err(invalid("missing unit")),
            other => return Err(invalid(&format!("unknown unit {other:?}"))),
        };
        total_nanos += value * scale;
        rest = &rest[unit_end..];
    }

    if total_nanos > u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
