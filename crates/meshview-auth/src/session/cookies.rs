//! Cookie naming and the per-request cookie jar
//!
//! # Cookie family
//!
//! | Cookie                   | Purpose                                      |
//! |--------------------------|----------------------------------------------|
//! | `session[-key]`          | first encrypted chunk                        |
//! | `session[-key]-<n>`      | continuation chunks, n = 1..count-1          |
//! | `session-chunks[-key]`   | chunk count, only when there is > 1 chunk    |
//! | `session-nonce[-key]`    | OAuth2/OIDC round-trip nonce                 |
//! | `session-pkce-verifier[-key]` | OIDC PKCE code verifier                 |
//!
//! The `-key` suffix is only used when more than one cluster is configured.

use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponseParts, ResponseParts};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Base name of the primary session cookie
pub const SESSION_COOKIE_NAME: &str = "session";
/// Base name of the chunk count cookie
pub const CHUNKS_COOKIE_NAME: &str = "session-chunks";
/// Base name of the login round-trip nonce cookie
pub const NONCE_COOKIE_NAME: &str = "session-nonce";
/// Base name of the PKCE code verifier cookie
pub const CODE_VERIFIER_COOKIE_NAME: &str = "session-pkce-verifier";

/// Computes cookie names for a session key
#[derive(Debug, Clone, Copy)]
pub struct CookieNames {
    multi_cluster: bool,
}

impl CookieNames {
    /// Names for a deployment with one or several clusters
    pub fn new(multi_cluster: bool) -> Self {
        Self { multi_cluster }
    }

    fn keyed(&self, base: &str, key: &str) -> String {
        if self.multi_cluster && !key.is_empty() {
            format!("{base}-{key}")
        } else {
            base.to_string()
        }
    }

    /// Primary session cookie (chunk 0)
    pub fn session(&self, key: &str) -> String {
        self.keyed(SESSION_COOKIE_NAME, key)
    }

    /// Continuation chunk `n` (n >= 1)
    pub fn chunk(&self, key: &str, n: usize) -> String {
        format!("{}-{n}", self.session(key))
    }

    /// Chunk count cookie
    pub fn chunks(&self, key: &str) -> String {
        self.keyed(CHUNKS_COOKIE_NAME, key)
    }

    /// Round-trip nonce cookie
    pub fn nonce(&self, key: &str) -> String {
        self.keyed(NONCE_COOKIE_NAME, key)
    }

    /// PKCE verifier cookie
    pub fn code_verifier(&self, key: &str) -> String {
        self.keyed(CODE_VERIFIER_COOKIE_NAME, key)
    }

    /// Whether `name` may hold chunk 0 of some session
    ///
    /// Keys may end in digits, so `session-east-1` is either the primary cookie
    /// of `east-1` or chunk 1 of `east`. Both readings are attempted by callers.
    pub fn is_potential_session(name: &str) -> bool {
        if name.contains("nonce") || name.contains("pkce-verifier") {
            return false;
        }
        if name.starts_with(CHUNKS_COOKIE_NAME) {
            return false;
        }
        name == SESSION_COOKIE_NAME || name.starts_with("session-")
    }

    /// Whether `name` is one of the session cookies of `key`
    pub fn belongs_to(&self, name: &str, key: &str) -> bool {
        if name.contains("nonce") || name.contains("pkce-verifier") {
            return false;
        }
        let primary = self.session(key);
        if name == primary || name == self.chunks(key) {
            return true;
        }
        name.strip_prefix(&primary)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }
}

/// Request cookies plus the `Set-Cookie` changes produced while serving it
///
/// Reads see the request cookies minus anything dropped during this request,
/// plus anything set during this request. Pending changes are emitted as
/// `Set-Cookie` headers when the jar is returned from a handler.
#[derive(Debug, Clone)]
pub struct SessionJar {
    request: CookieJar,
    pending: Vec<Cookie<'static>>,
    path: String,
    secure: bool,
}

impl SessionJar {
    /// Parse the `Cookie` headers of a request
    pub fn from_headers(headers: &HeaderMap, path: impl Into<String>, secure: bool) -> Self {
        Self {
            request: CookieJar::from_headers(headers),
            pending: Vec::new(),
            path: path.into(),
            secure,
        }
    }

    /// Whether cookies written through this jar carry the `Secure` attribute
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Current value of a cookie, if present and non-empty
    pub fn get(&self, name: &str) -> Option<&str> {
        if let Some(cookie) = self.pending.iter().find(|c| c.name() == name) {
            return Some(cookie.value()).filter(|v| !v.is_empty());
        }
        self.request
            .get(name)
            .map(|c| c.value())
            .filter(|v| !v.is_empty())
    }

    /// Names of the request cookies that have not been dropped since
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .request
            .iter()
            .map(|c| c.name().to_string())
            .filter(|name| {
                !self
                    .pending
                    .iter()
                    .any(|p| p.name() == name.as_str() && p.value().is_empty())
            })
            .collect();
        names.sort();
        names
    }

    /// Set an `HttpOnly` cookie below the web root
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        expires: DateTime<Utc>,
        same_site: SameSite,
    ) {
        let expires = OffsetDateTime::from_unix_timestamp(expires.timestamp())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let cookie = Cookie::build((name.into(), value.into()))
            .path(self.path.clone())
            .http_only(true)
            .secure(self.secure)
            .same_site(same_site)
            .expires(expires)
            .build();
        self.push(cookie);
    }

    /// Overwrite a cookie with an empty, already expired one
    pub fn drop_cookie(&mut self, name: impl Into<String>) {
        let name = name.into();
        debug!(cookie = %name, "Dropping cookie");
        let cookie = Cookie::build((name, ""))
            .path(self.path.clone())
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .expires(OffsetDateTime::UNIX_EPOCH)
            .max_age(time::Duration::ZERO)
            .build();
        self.push(cookie);
    }

    fn push(&mut self, cookie: Cookie<'static>) {
        self.pending.retain(|c| c.name() != cookie.name());
        self.pending.push(cookie);
    }

    /// Cookies that will be sent back as `Set-Cookie`, in write order
    pub fn pending(&self) -> &[Cookie<'static>] {
        &self.pending
    }

    /// Pending cookie by name
    pub fn pending_cookie(&self, name: &str) -> Option<&Cookie<'static>> {
        self.pending.iter().find(|c| c.name() == name)
    }
}

impl IntoResponseParts for SessionJar {
    type Error = std::convert::Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        for cookie in self.pending {
            match HeaderValue::from_str(&cookie.to_string()) {
                Ok(value) => {
                    res.headers_mut().append(SET_COOKIE, value);
                }
                Err(e) => warn!(cookie = %cookie.name(), error = %e, "Skipping unencodable cookie"),
            }
        }
        Ok(res)
    }
}
