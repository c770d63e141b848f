mod common;

use common::test_helpers::request_from;
use std::io::Write;
use std::time::Duration;
use tollgate::prelude::*;

const LIMITS: &str = r#"
defaults:
  capacity: 2
  refill_rate: 1.0
policies:
  /internal/metrics:
    capacity: 1
    refill_rate: 1.0
    enabled: false
key_extractor: "header:X-API-Key, ip"
cleanup_age: 1h30m
"#;

fn limits_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(LIMITS.as_bytes()).unwrap();
    file
}

#[test]
fn limiter_from_yaml_file() {
    let file = limits_file();
    let limiter = RateLimiter::builder().config_file(file.path()).build().unwrap();

    let config = limiter.config();
    assert_eq!(config.defaults.capacity, 2);
    assert_eq!(config.parsed_cleanup_age().unwrap(), Duration::from_secs(5_400));
    assert_eq!(
        limiter.key_extractor(),
        &KeyExtractor::Composite(vec![KeyExtractor::Header("X-API-Key".into()), KeyExtractor::Ip])
    );
}

#[test]
fn composite_extractor_prefers_api_key_then_ip() {
    let file = limits_file();
    let limiter = RateLimiter::builder().config_file(file.path()).build().unwrap();

    let mut keyed = request_from("192.0.2.1:1", "/api");
    keyed.headers_mut().insert("x-api-key", "team-a".parse().unwrap());
    assert_eq!(limiter.allow_request(&keyed).unwrap().key, "header:X-API-Key:team-a");

    let anonymous = request_from("192.0.2.1:1", "/api");
    assert_eq!(limiter.allow_request(&anonymous).unwrap().key, "ip:192.0.2.1");
}

#[test]
fn disabled_route_from_file_is_unlimited() {
    let file = limits_file();
    let limiter = RateLimiter::builder().config_file(file.path()).build().unwrap();
    for _ in 0..10 {
        let d = limiter.allow_request(&request_from("192.0.2.1:1", "/internal/metrics")).unwrap();
        assert!(d.allowed);
        assert_eq!(d.limit, 1);
    }
    assert_eq!(limiter.store().count(), 0);
}

#[test]
fn invalid_files_fail_the_build() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"defaults:\n  capacity: 0\n  refill_rate: 1\n").unwrap();
    let err = RateLimiter::builder().config_file(file.path()).build().unwrap_err();
    assert!(matches!(err, RateLimitError::InvalidCapacity { provided: 0 }));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"cleanup_age: forever\n").unwrap();
    let err = RateLimiter::builder().config_file(file.path()).build().unwrap_err();
    assert!(err.is_invalid_configuration());
}

#[test]
fn explicit_options_override_file_values() {
    let file = limits_file();
    let limiter = RateLimiter::builder()
        .config_file(file.path())
        .key_extractor(KeyExtractor::Static("everyone".into()))
        .cleanup_age(Duration::ZERO)
        .build()
        .unwrap();
    let d = limiter.allow_request(&request_from("192.0.2.1:1", "/")).unwrap();
    assert_eq!(d.key, "everyone");
    assert_eq!(limiter.cleanup().unwrap(), 0);
}

#[test]
fn config_round_trips_through_yaml() {
    let mut config = LimiterConfig::default();
    config.set_policy("/login", PolicyConfig::new(5, 0.1)).unwrap();
    let yaml = serde_yaml::to_string(&config).unwrap();
    assert_eq!(LimiterConfig::from_yaml_str(&yaml).unwrap(), config);
}
