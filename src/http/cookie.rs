//! Cookies and the shared cookie jar
//!
//! A [`CookieJar`] is a cheaply clonable handle onto one per-host store.
//! Clones share state, so several exchanges (and the server-side capture
//! path) see the same cookies when handed the same jar.
//!
//! ```
//! use h1wire::http::{Cookie, CookieJar};
//!
//! let jar = CookieJar::new();
//! jar.set("example.com", Cookie::new("session", "abc"));
//! jar.set("example.com", Cookie::new("session", "def"));
//!
//! let cookies = jar.get("example.com");
//! assert_eq!(cookies.len(), 1);
//! assert_eq!(cookies[0].value(), "def");
//! ```

use super::date::parse_http_date;
use super::headers::Headers;
use super::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

/// One cookie with its Set-Cookie attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    http_only: bool,
    expires: Option<SystemTime>,
    max_age: Option<i64>,
    received_at: SystemTime,
}

impl Cookie {
    /// Create a session cookie received now
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            expires: None,
            max_age: None,
            received_at: SystemTime::now(),
        }
    }

    /// Parse a `Set-Cookie` header value.
    ///
    /// Unknown attributes are ignored. A malformed `Expires` or `Max-Age` is
    /// dropped rather than rejecting the cookie.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.split(';');
        let pair = parts.next().unwrap_or_default().trim();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Parse(format!("cookie without '=': {}", pair)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Parse(format!("cookie without name: {}", pair)));
        }

        let mut cookie = Cookie::new(name, unquote(value.trim()));

        for attr in parts {
            let attr = attr.trim();
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr, ""),
            };

            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    cookie.domain = Some(val.trim_start_matches('.').to_ascii_lowercase());
                }
                "path" if val.starts_with('/') => cookie.path = Some(val.to_string()),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "expires" => match parse_http_date(val) {
                    Ok(date) => cookie.expires = Some(date),
                    Err(e) => tracing::debug!(cookie = name, error = %e, "ignoring Expires"),
                },
                "max-age" => match val.parse::<i64>() {
                    Ok(secs) => cookie.max_age = Some(secs),
                    Err(_) => tracing::debug!(cookie = name, value = val, "ignoring Max-Age"),
                },
                _ => {}
            }
        }

        Ok(cookie)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn http_only(&self) -> bool {
        self.http_only
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    pub fn max_age(&self) -> Option<i64> {
        self.max_age
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        self.domain = Some(domain.trim_start_matches('.').to_ascii_lowercase());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_expires(mut self, expires: SystemTime) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_max_age(mut self, secs: i64) -> Self {
        self.max_age = Some(secs);
        self
    }

    pub fn with_received_at(mut self, received_at: SystemTime) -> Self {
        self.received_at = received_at;
        self
    }

    /// Whether the cookie has expired as of now
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Whether the cookie has expired as of `now`.
    ///
    /// Max-Age takes precedence over Expires and counts from the receipt
    /// time. An Expires date at or before the receipt time means the server
    /// asked for deletion. Cookies without either never expire.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        if let Some(max_age) = self.max_age {
            if max_age <= 0 {
                return true;
            }
            // A deadline past what SystemTime can hold never arrives
            return self
                .received_at
                .checked_add(Duration::from_secs(max_age as u64))
                .is_some_and(|deadline| deadline <= now);
        }
        match self.expires {
            Some(expires) => expires <= self.received_at || expires <= now,
            None => false,
        }
    }

    /// Whether the cookie belongs on a request to `host` for `target`
    pub fn matches(&self, host: &str, target: &str, secure: bool) -> bool {
        if self.secure && !secure {
            return false;
        }
        if let Some(domain) = &self.domain {
            if !domain_matches(host, domain) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            let request_path = target.split(['?', '#']).next().unwrap_or("/");
            if !request_path.starts_with(path.as_str()) {
                return false;
            }
        }
        true
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Thread-safe per-host cookie store
///
/// Holds at most one cookie per `(host, name)`. The lock is only held for
/// the duration of each method call.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    hosts: Arc<Mutex<HashMap<String, Vec<Cookie>>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Cookie>>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the cookies stored for `host`, in insertion order
    pub fn get(&self, host: &str) -> Vec<Cookie> {
        self.lock()
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Store `cookie` for `host`, replacing any cookie with the same name.
    ///
    /// Returns the replaced cookie.
    pub fn set(&self, host: &str, cookie: Cookie) -> Option<Cookie> {
        let mut hosts = self.lock();
        let cookies = hosts.entry(host.to_ascii_lowercase()).or_default();
        match cookies.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => Some(std::mem::replace(existing, cookie)),
            None => {
                cookies.push(cookie);
                None
            }
        }
    }

    /// Remove the cookie called `name` from `host`
    pub fn remove(&self, host: &str, name: &str) -> Option<Cookie> {
        let mut hosts = self.lock();
        let cookies = hosts.get_mut(&host.to_ascii_lowercase())?;
        let index = cookies.iter().position(|c| c.name == name)?;
        Some(cookies.remove(index))
    }

    /// Drop every cookie stored for `host`
    pub fn clear(&self, host: &str) {
        self.lock().remove(&host.to_ascii_lowercase());
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values().all(Vec::is_empty)
    }

    /// Build the `Cookie` header value for a request to `host` for `target`.
    ///
    /// Only unexpired cookies whose secure flag, domain and path fit the
    /// request are included. Returns `None` when nothing matches.
    pub fn cookie_header(&self, host: &str, target: &str, secure: bool) -> Option<String> {
        let now = SystemTime::now();
        let pairs: Vec<String> = self
            .get(host)
            .iter()
            .filter(|c| !c.is_expired_at(now) && c.matches(host, target, secure))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Record one `Set-Cookie` value received from `host`.
    ///
    /// An already-expired cookie deletes the stored one of the same name.
    /// Malformed values are logged and ignored.
    pub fn capture_set_cookie(&self, host: &str, value: &str) {
        let cookie = match Cookie::parse(value) {
            Ok(cookie) => cookie,
            Err(e) => {
                tracing::warn!(host, error = %e, "ignoring malformed Set-Cookie");
                return;
            }
        };

        if cookie.is_expired() {
            tracing::debug!(host, name = cookie.name(), "cookie deleted by server");
            self.remove(host, cookie.name());
        } else {
            tracing::debug!(host, name = cookie.name(), "cookie stored");
            self.set(host, cookie);
        }
    }

    /// Record the cookies a client sent to us in its `Cookie` headers
    pub fn capture_request_cookies(&self, host: &str, headers: &Headers) {
        for line in headers.get_all("Cookie") {
            for pair in line.split(';') {
                let Some((name, value)) = pair.split_once('=') else {
                    continue;
                };
                let name = name.trim();
                if !name.is_empty() {
                    self.set(host, Cookie::new(name, value.trim()));
                }
            }
        }
    }
}
