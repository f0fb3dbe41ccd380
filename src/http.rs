//! Construction of the two reqwest clients the worker uses.
//!
//! The warm-up client carries the configured warm-up headers and never
//! follows redirects (a redirect on a warm-up request indicates a
//! misconfigured URL, not something to chase). The session client also
//! has redirects disabled because the session manager follows them
//! manually to observe `Set-Cookie` headers on every hop.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client};

use crate::error::ConfigError;

pub const USER_AGENT: &str = concat!("pagewarm/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers added to every warm-up request. `X-Warmup` instructs the cache
/// layer to skip returning the body (expected code becomes 204);
/// `Accept-Encoding` must match what the cache normalizes on.
pub const DEFAULT_WARMUP_HEADERS: &[(&str, &str)] =
    &[("X-Warmup", "yes"), ("Accept-Encoding", "gzip")];

pub fn default_warmup_headers() -> BTreeMap<String, String> {
    DEFAULT_WARMUP_HEADERS
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn build_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, ConfigError> {
    let mut map = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("invalid warm-up header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConfigError::Invalid(format!("invalid warm-up header value for {name}: {e}")))?;
        map.insert(name, value);
    }

    Ok(map)
}

/// Client for warm-up requests.
pub fn warmup_client(
    timeout: Duration,
    headers: &BTreeMap<String, String>,
) -> Result<Client, ConfigError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .redirect(redirect::Policy::none())
        .default_headers(build_header_map(headers)?)
        .build()
        .map_err(|e| ConfigError::Invalid(format!("failed to build warm-up HTTP client: {e}")))
}

/// Client for login-flow requests.
pub fn session_client(timeout: Duration) -> Result<Client, ConfigError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .redirect(redirect::Policy::none())
        .gzip(true)
        .build()
        .map_err(|e| ConfigError::Invalid(format!("failed to build session HTTP client: {e}")))
}
