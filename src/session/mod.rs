//! Per (host, customer group) authentication state.
//!
//! A session is a small cookie set plus metadata, persisted so it
//! survives process restarts and can be shared by concurrent worker
//! processes. Validity is never stored; it is recomputed from the cookie
//! set every time (see [`Session::is_valid`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub mod credentials;
pub mod manager;
pub mod store;

pub use credentials::{Credentials, CredentialsProvider, PreconfiguredCredentialsProvider};
pub use manager::SessionManager;
pub use store::SessionStore;

/// Shared handle to a session. Jobs within a batch that target the same
/// (host, customer group) pair all hold the same session.
pub type SessionHandle = Arc<RwLock<Session>>;

/// A single cookie's value and its own expiry, if the origin set one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
}

impl Cookie {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(expires) if expires <= now)
    }
}

/// Parse a `Set-Cookie` header value into a name and [`Cookie`].
///
/// Only the attributes this worker cares about are interpreted:
/// `Max-Age` (which wins over `Expires`, per RFC 6265) and `Expires` in
/// either the IMF-fixdate or the legacy dash-separated format.
pub fn parse_set_cookie(header: &str, now: DateTime<Utc>) -> Option<(String, Cookie)> {
    let mut parts = header.split(';');

    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();

    if name.is_empty() {
        return None;
    }

    let mut max_age: Option<i64> = None;
    let mut expires: Option<DateTime<Utc>> = None;

    for attribute in parts {
        let (key, val) = match attribute.split_once('=') {
            Some((key, val)) => (key.trim(), val.trim()),
            None => continue,
        };

        if key.eq_ignore_ascii_case("max-age") {
            max_age = val.parse().ok();
        } else if key.eq_ignore_ascii_case("expires") {
            expires = parse_cookie_date(val);
        }
    }

    let expires = match max_age {
        Some(seconds) => Some(now + ChronoDuration::seconds(seconds)),
        None => expires,
    };

    Some((
        name.to_string(),
        Cookie {
            value: value.trim().to_string(),
            expires,
        },
    ))
}

fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    // Legacy Netscape format: "Wed, 09-Jun-2021 10:18:14 GMT"
    NaiveDateTime::parse_from_str(value, "%a, %d-%b-%Y %H:%M:%S GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Authentication state for one (host, customer group) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    host: String,
    customer_group: Option<String>,
    created: DateTime<Utc>,
    cookies: BTreeMap<String, Cookie>,
    invalidated: bool,
}

impl Session {
    /// Cookie the origin issues for every visitor session.
    pub const SESSION_COOKIE: &'static str = "PHPSESSID";

    /// Cookie the origin sets only for logged-in variants. Its presence
    /// after a login POST is the proof that authentication succeeded.
    pub const VARY_COOKIE: &'static str = "X-Magento-Vary";

    /// The origin rewrites the vary cookie to this value on logout, so it
    /// must be treated as absent.
    pub const DELETED_COOKIE_VALUE: &'static str = "deleted";

    pub fn new(host: impl Into<String>, customer_group: Option<String>) -> Self {
        Self {
            host: host.into(),
            customer_group,
            created: Utc::now(),
            cookies: BTreeMap::new(),
            invalidated: false,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn customer_group(&self) -> Option<&str> {
        self.customer_group.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.customer_group.is_none()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    /// Absorb a `Set-Cookie` response header into the cookie set.
    pub fn apply_set_cookie(&mut self, header: &str, now: DateTime<Utc>) {
        if let Some((name, cookie)) = parse_set_cookie(header, now) {
            self.cookies.insert(name, cookie);
        }
    }

    /// Render the unexpired cookies as a `Cookie` request header value.
    pub fn cookie_header(&self, now: DateTime<Utc>) -> Option<String> {
        let rendered: Vec<String> = self
            .cookies
            .iter()
            .filter(|(_, cookie)| !cookie.is_expired(now))
            .map(|(name, cookie)| format!("{}={}", name, cookie.value))
            .collect();

        if rendered.is_empty() {
            None
        } else {
            Some(rendered.join("; "))
        }
    }

    /// Recomputed validity:
    /// - a server-issued session cookie must be present and unexpired
    ///   (a missing cookie means the session was never initialized);
    /// - authenticated sessions additionally need the vary cookie,
    ///   unexpired and not rewritten to the logout sentinel;
    /// - an invalidated session is never valid.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.invalidated {
            return false;
        }

        match self.cookies.get(Self::SESSION_COOKIE) {
            Some(cookie) if !cookie.is_expired(now) => {}
            _ => return false,
        }

        if self.is_anonymous() {
            return true;
        }

        matches!(
            self.cookies.get(Self::VARY_COOKIE),
            Some(cookie) if cookie.value != Self::DELETED_COOKIE_VALUE && !cookie.is_expired(now)
        )
    }

    /// Forcibly flip validity off. The manager persists the session right
    /// after, so other processes stop using it too.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Return to the uninitialized state, used just before
    /// re-authentication.
    pub fn reset(&mut self) {
        self.cookies.clear();
        self.invalidated = false;
        self.created = Utc::now();
    }
}
