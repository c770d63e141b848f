//! Deriving rate limit keys from HTTP requests.
//!
//! A [`KeyExtractor`] is plain data, parsed from a configuration string:
//!
//! | spec             | extractor                                   | key produced                 |
//! |------------------|---------------------------------------------|------------------------------|
//! | `ip`             | [`KeyExtractor::Ip`]                        | `ip:<addr>`                  |
//! | `ip-proxy`       | [`KeyExtractor::IpWithProxy`]               | `ip:<addr>`                  |
//! | `header:<Name>`  | [`KeyExtractor::Header`]                    | `header:<Name>:<value>`      |
//! | `bearer`         | [`KeyExtractor::Bearer`]                    | `bearer:<token>`             |
//! | `cookie:<name>`  | [`KeyExtractor::Cookie`]                    | `cookie:<name>:<value>`      |
//! | `static:<key>`   | [`KeyExtractor::Static`]                    | `<key>`                      |
//! | `a,b,...`        | [`KeyExtractor::Composite`] (first success) | whatever the winner produces |
//!
//! The peer address is read from a [`SocketAddr`] or [`ClientAddr`] request extension,
//! which the server integration is expected to insert.

use crate::RateLimitError;
use http::header::{AUTHORIZATION, COOKIE};
use http::Request;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Client address attached to a request as an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub IpAddr);

/// Strategy for turning a request into a rate limit key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyExtractor {
    /// Peer IP address.
    #[default]
    Ip,
    /// First `X-Forwarded-For` entry, else `X-Real-IP`, else the peer address.
    IpWithProxy,
    /// Value of the named header.
    Header(String),
    /// Token from `Authorization: Bearer <token>`.
    Bearer,
    /// Value of the named cookie.
    Cookie(String),
    /// A fixed key shared by every request.
    Static(String),
    /// Try each extractor in order and use the first that succeeds.
    Composite(Vec<KeyExtractor>),
}

impl KeyExtractor {
    /// Parse an extractor spec such as `"ip"`, `"header:X-API-Key"` or
    /// `"header:X-API-Key,ip-proxy"`.
    ///
    /// A `static:` key runs to the end of the spec, so it may contain commas and must be
    /// the last part of a composite.
    pub fn parse(spec: &str) -> Result<Self, RateLimitError> {
        let mut parts = Vec::new();
        let mut rest = spec.trim();
        loop {
            if rest.starts_with("static:") {
                parts.push(Self::parse_single(rest)?);
                break;
            }
            match rest.split_once(',') {
                Some((part, tail)) => {
                    parts.push(Self::parse_single(part.trim())?);
                    rest = tail.trim();
                }
                None => {
                    parts.push(Self::parse_single(rest)?);
                    break;
                }
            }
        }
        if parts.len() == 1 {
            return Ok(parts.remove(0));
        }
        Ok(Self::Composite(parts))
    }

    fn parse_single(spec: &str) -> Result<Self, RateLimitError> {
        let (kind, arg) = match spec.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (spec, None),
        };
        let required = |what: &str| match arg {
            Some(a) if !a.is_empty() => Ok(a.to_string()),
            _ => Err(RateLimitError::config(format!(
                "{kind} extractor requires the form '{kind}:{what}'"
            ))),
        };
        match kind {
            "ip" => Ok(Self::Ip),
            "ip-proxy" => Ok(Self::IpWithProxy),
            "bearer" => Ok(Self::Bearer),
            "header" => required("HeaderName").map(Self::Header),
            "cookie" => required("CookieName").map(Self::Cookie),
            "static" => required("key").map(Self::Static),
            _ => Err(RateLimitError::config(format!("unknown key extractor: {spec}"))),
        }
    }

    /// Derive the key for `req`. Every failure is [`RateLimitError::KeyExtractionFailed`].
    pub fn extract<B>(&self, req: &Request<B>) -> Result<String, RateLimitError> {
        match self {
            Self::Ip => peer_ip(req).map(|ip| format!("ip:{ip}")),
            Self::IpWithProxy => proxied_ip(req),
            Self::Header(name) => {
                let value = header_str(req, name)?
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| RateLimitError::extraction(format!("header {name} not found or empty")))?;
                Ok(format!("header:{name}:{value}"))
            }
            Self::Bearer => bearer_token(req).map(|token| format!("bearer:{token}")),
            Self::Cookie(name) => cookie_value(req, name).map(|value| format!("cookie:{name}:{value}")),
            Self::Static(key) if key.is_empty() => Err(RateLimitError::extraction("static key is empty")),
            Self::Static(key) => Ok(key.clone()),
            Self::Composite(extractors) => {
                let mut last_err = None;
                for extractor in extractors {
                    match extractor.extract(req) {
                        Ok(key) => return Ok(key),
                        Err(err) => last_err = Some(err),
                    }
                }
                Err(match last_err {
                    Some(err) => RateLimitError::extraction(format!("all extractors failed: {err}")),
                    None => RateLimitError::extraction("no extractors configured"),
                })
            }
        }
    }
}

impl FromStr for KeyExtractor {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => f.write_str("ip"),
            Self::IpWithProxy => f.write_str("ip-proxy"),
            Self::Header(name) => write!(f, "header:{name}"),
            Self::Bearer => f.write_str("bearer"),
            Self::Cookie(name) => write!(f, "cookie:{name}"),
            Self::Static(key) => write!(f, "static:{key}"),
            Self::Composite(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{part}")?;
                }
                Ok(())
            }
        }
    }
}

fn header_str<'a, B>(req: &'a Request<B>, name: &str) -> Result<Option<&'a str>, RateLimitError> {
    match req.headers().get(name) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .map(|s| Some(s.trim()))
            .map_err(|_| RateLimitError::extraction(format!("header {name} is not valid text"))),
    }
}

fn peer_ip<B>(req: &Request<B>) -> Result<IpAddr, RateLimitError> {
    let ext = req.extensions();
    ext.get::<ClientAddr>()
        .map(|c| c.0)
        .or_else(|| ext.get::<SocketAddr>().map(SocketAddr::ip))
        .ok_or_else(|| RateLimitError::extraction("peer address unavailable"))
}

fn proxied_ip<B>(req: &Request<B>) -> Result<String, RateLimitError> {
    if let Some(xff) = header_str(req, X_FORWARDED_FOR)? {
        let first = xff.split(',').next().map(str::trim).unwrap_or_default();
        if !first.is_empty() {
            return Ok(format!("ip:{first}"));
        }
    }
    if let Some(real) = header_str(req, X_REAL_IP)?.filter(|s| !s.is_empty()) {
        return Ok(format!("ip:{real}"));
    }
    peer_ip(req).map(|ip| format!("ip:{ip}"))
}

fn bearer_token<B>(req: &Request<B>) -> Result<&str, RateLimitError> {
    let auth = header_str(req, AUTHORIZATION.as_str())?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RateLimitError::extraction("Authorization header not found"))?;
    let (_, token) = auth
        .split_once(' ')
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .ok_or_else(|| RateLimitError::extraction("invalid Authorization header format"))?;
    let token = token.trim();
    if token.is_empty() {
        return Err(RateLimitError::extraction("empty bearer token"));
    }
    Ok(token)
}

fn cookie_value<'a, B>(req: &'a Request<B>, name: &str) -> Result<&'a str, RateLimitError> {
    let found = req
        .headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| {
            let v = v.trim();
            v.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(v)
        });
    match found {
        None => Err(RateLimitError::extraction(format!("cookie {name} not found"))),
        Some("") => Err(RateLimitError::extraction(format!("cookie {name} has empty value"))),
        Some(value) => Ok(value),
    }
}
