//! Cookie backed session store
//!
//! Sessions are written as `session[-key]` plus `session[-key]-<n>` chunks when
//! the sealed value does not fit in a single cookie; `session-chunks[-key]`
//! then records how many pieces to reassemble.
//!
//! # Usage
//!
//! ```ignore
//! let store = CookieSessionStore::<TokenPayload>::new(codec, names, AuthStrategy::Token, clock);
//! let data = store.new_session("east", expires_on, payload)?;
//! store.create_session(&mut jar, &data)?;
//! let back = store.read_session(&mut jar, "east")?;
//! ```

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use axum_extra::extract::cookie::SameSite;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use meshview_common::{AuthStrategy, Clock};

use super::codec::{split_chunks, SessionCodec, MAX_SESSION_CHUNKS, SESSION_COOKIE_MAX_SIZE};
use super::cookies::{CookieNames, SessionJar, SESSION_COOKIE_NAME};
use super::SessionData;
use crate::error::{Error, Result};

/// Why a cookie could not be turned into a session
enum ReadFailure {
    Missing,
    Invalid(String),
}

/// Stores [`SessionData`] in encrypted, chunked cookies
pub struct CookieSessionStore<P> {
    codec: Arc<SessionCodec>,
    names: CookieNames,
    strategy: AuthStrategy,
    clock: Arc<dyn Clock>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for CookieSessionStore<P> {
    fn clone(&self) -> Self {
        Self {
            codec: Arc::clone(&self.codec),
            names: self.names,
            strategy: self.strategy,
            clock: Arc::clone(&self.clock),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for CookieSessionStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSessionStore")
            .field("names", &self.names)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<P: Serialize + DeserializeOwned> CookieSessionStore<P> {
    /// Store for sessions created by `strategy`
    pub fn new(
        codec: Arc<SessionCodec>,
        names: CookieNames,
        strategy: AuthStrategy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            codec,
            names,
            strategy,
            clock,
            _payload: PhantomData,
        }
    }

    /// Store of the same family holding a different payload or strategy
    pub fn with_strategy<Q>(&self, strategy: AuthStrategy) -> CookieSessionStore<Q> {
        CookieSessionStore {
            codec: Arc::clone(&self.codec),
            names: self.names,
            strategy,
            clock: Arc::clone(&self.clock),
            _payload: PhantomData,
        }
    }

    /// Cookie naming used by this store
    pub fn names(&self) -> CookieNames {
        self.names
    }

    /// Clock used for expiry checks
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Build a session record tagged with this store's strategy
    pub fn new_session(
        &self,
        key: impl Into<String>,
        expires_on: DateTime<Utc>,
        payload: P,
    ) -> Result<SessionData<P>> {
        SessionData::new(key, self.strategy, expires_on, payload, self.clock.as_ref())
    }

    /// Write `data` to the jar, replacing whatever session `data.key()` had
    pub fn create_session(&self, jar: &mut SessionJar, data: &SessionData<P>) -> Result<()> {
        let json = serde_json::to_vec(data)
            .map_err(|e| Error::Session(format!("cannot serialize session: {e}")))?;
        let sealed = self.codec.seal(&json)?;
        let chunks = split_chunks(&sealed, SESSION_COOKIE_MAX_SIZE);
        if chunks.len() > MAX_SESSION_CHUNKS {
            return Err(Error::Session(format!(
                "session data needs {} cookies, more than the allowed {MAX_SESSION_CHUNKS}",
                chunks.len()
            )));
        }

        // Leftovers of a previous, larger session would corrupt reassembly
        self.terminate_session(jar, data.key());

        let key = data.key();
        let expires = data.expires_on();
        for (n, chunk) in chunks.iter().enumerate() {
            let name = if n == 0 {
                self.names.session(key)
            } else {
                self.names.chunk(key, n)
            };
            jar.set(name, *chunk, expires, SameSite::Strict);
        }
        if chunks.len() > 1 {
            jar.set(
                self.names.chunks(key),
                chunks.len().to_string(),
                expires,
                SameSite::Strict,
            );
        }

        debug!(
            key = %key,
            chunks = chunks.len(),
            strategy = %data.strategy(),
            "Created session"
        );
        Ok(())
    }

    /// Read the session stored under `key`
    ///
    /// Any failure other than the cookie being absent also drops the session
    /// cookies of `key`.
    pub fn read_session(&self, jar: &mut SessionJar, key: &str) -> Result<SessionData<P>> {
        let primary = self.names.session(key);
        let data = match self.read_cookie(jar, &primary) {
            Ok((data, _)) => data,
            Err(ReadFailure::Missing) => {
                return Err(Error::SessionNotFound(format!(
                    "cookie {primary} does not exist in request"
                )))
            }
            Err(ReadFailure::Invalid(reason)) => {
                info!(key = %key, reason = %reason, "Discarding unreadable session");
                self.terminate_session(jar, key);
                return Err(Error::SessionNotFound(reason));
            }
        };

        if let Err(reason) = self.check_validity(&data) {
            self.terminate_session(jar, key);
            return Err(Error::SessionNotFound(reason));
        }

        Ok(data)
    }

    /// Read every session carried by the request
    ///
    /// Cookies that look like sessions but decode to nothing are dropped unless
    /// they turned out to be continuation chunks of a session that did decode.
    /// Expired sessions and sessions of another strategy are dropped as well.
    pub fn read_all_sessions(&self, jar: &mut SessionJar) -> Result<Vec<SessionData<P>>> {
        let candidates: Vec<String> = jar
            .names()
            .into_iter()
            .filter(|name| CookieNames::is_potential_session(name))
            .collect();

        let mut sessions = Vec::new();
        let mut consumed = HashSet::new();
        let mut failed = Vec::new();
        for name in candidates {
            match self.read_cookie(jar, &name) {
                Ok((data, cookies)) => {
                    consumed.extend(cookies);
                    sessions.push(data);
                }
                Err(ReadFailure::Invalid(reason)) => failed.push((name, reason)),
                Err(ReadFailure::Missing) => {}
            }
        }

        for (name, reason) in failed {
            if consumed.contains(&name) {
                continue;
            }
            info!(cookie = %name, reason = %reason, "Dropping malformed session cookie");
            // Only a name this mode writes as a primary owns a chunk count;
            // in single-cluster mode `session-chunks` is shared by every name.
            let key = key_of(&name);
            let chunks = self.names.chunks(key);
            let owns_chunks = self.names.session(key) == name && !consumed.contains(&chunks);
            jar.drop_cookie(name);
            if owns_chunks && jar.get(&chunks).is_some() {
                jar.drop_cookie(chunks);
            }
        }

        let mut valid = Vec::with_capacity(sessions.len());
        for data in sessions {
            match self.check_validity(&data) {
                Ok(()) => valid.push(data),
                Err(reason) => {
                    info!(key = %data.key(), reason = %reason, "Dropping session");
                    self.terminate_session(jar, data.key());
                }
            }
        }

        if valid.is_empty() {
            return Err(Error::SessionNotFound(
                "no session cookies were found in the request".into(),
            ));
        }
        Ok(valid)
    }

    /// Drop every session cookie of `key`; a no-op when there are none
    pub fn terminate_session(&self, jar: &mut SessionJar, key: &str) {
        for name in jar.names() {
            if self.names.belongs_to(&name, key) {
                jar.drop_cookie(name);
            }
        }
    }

    fn check_validity(&self, data: &SessionData<P>) -> std::result::Result<(), String> {
        if data.strategy() != self.strategy.as_str() {
            return Err(format!(
                "session was created with strategy {} but the current strategy is {}",
                data.strategy(),
                self.strategy
            ));
        }
        if self.clock.now() >= data.expires_on() {
            return Err(format!(
                "session of {} expired on {}",
                data.key(),
                data.expires_on()
            ));
        }
        Ok(())
    }

    /// Reassemble and decode the session whose first chunk is `primary`,
    /// returning the names of every cookie it was read from
    fn read_cookie(
        &self,
        jar: &SessionJar,
        primary: &str,
    ) -> std::result::Result<(SessionData<P>, Vec<String>), ReadFailure> {
        let first = jar.get(primary).ok_or(ReadFailure::Missing)?;
        let mut cookies = vec![primary.to_string()];
        let mut encoded = first.to_string();

        let chunks_name = self.names.chunks(key_of(primary));
        if let Some(count) = jar.get(&chunks_name) {
            let count: usize = count.parse().map_err(|_| {
                ReadFailure::Invalid(format!("chunk count [{count}] is not a number"))
            })?;
            if !(1..=MAX_SESSION_CHUNKS).contains(&count) {
                return Err(ReadFailure::Invalid(format!(
                    "chunk count {count} is outside 1..={MAX_SESSION_CHUNKS}"
                )));
            }
            for n in 1..count {
                let name = format!("{primary}-{n}");
                let chunk = jar.get(&name).ok_or_else(|| {
                    ReadFailure::Invalid(format!("session chunk {name} is missing"))
                })?;
                encoded.push_str(chunk);
                cookies.push(name);
            }
            cookies.push(chunks_name);
        }

        let plaintext = self
            .codec
            .open(&encoded)
            .map_err(|e| ReadFailure::Invalid(e.to_string()))?;
        let data = serde_json::from_slice(&plaintext)
            .map_err(|e| ReadFailure::Invalid(format!("cannot parse session: {e}")))?;
        Ok((data, cookies))
    }
}

/// Session key encoded in a primary cookie name
fn key_of(cookie_name: &str) -> &str {
    cookie_name
        .strip_prefix(SESSION_COOKIE_NAME)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or("")
}
