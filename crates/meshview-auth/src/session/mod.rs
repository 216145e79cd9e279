//! Client-held sessions
//!
//! A session is a [`SessionData`] record serialized to JSON, sealed by the
//! [`SessionCodec`] and written to one or more cookies by the
//! [`CookieSessionStore`]. Nothing is stored server side; the signing key is the
//! only shared state.

pub mod codec;
pub mod cookies;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use meshview_common::{AuthStrategy, Clock};

use crate::error::{Error, Result};

pub use codec::{SessionCodec, MAX_SESSION_CHUNKS, SESSION_COOKIE_MAX_SIZE};
pub use cookies::{CookieNames, SessionJar};
pub use store::CookieSessionStore;

/// The unit persisted in session cookies
///
/// Immutable once built; a changed session is a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData<P> {
    /// Cluster the session belongs to
    #[serde(rename = "cluster")]
    key: String,
    /// Instant after which the session is no longer valid
    expires_on: DateTime<Utc>,
    /// Strategy specific data
    payload: P,
    /// Distinguishes concurrent sessions of the same user
    session_id: Uuid,
    /// Strategy that created the session
    strategy: String,
}

impl<P: Serialize> SessionData<P> {
    /// Build a session record
    ///
    /// Fails when `expires_on` is not in the future or the payload serializes to
    /// nothing.
    pub fn new(
        key: impl Into<String>,
        strategy: AuthStrategy,
        expires_on: DateTime<Utc>,
        payload: P,
        clock: &dyn Clock,
    ) -> Result<Self> {
        let serialized = serde_json::to_value(&payload)
            .map_err(|e| Error::Session(format!("cannot serialize session payload: {e}")))?;
        let empty = match &serialized {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.is_empty(),
            serde_json::Value::Object(o) => o.is_empty(),
            _ => false,
        };
        if empty {
            return Err(Error::Session(
                "a session cannot be created with an empty payload".into(),
            ));
        }

        if clock.now() >= expires_on {
            return Err(Error::Session(
                "the expiration time of a session cannot be in the past".into(),
            ));
        }

        Ok(Self {
            key: key.into(),
            expires_on,
            payload,
            session_id: Uuid::new_v4(),
            strategy: strategy.as_str().to_string(),
        })
    }
}

impl<P> SessionData<P> {
    /// Cluster the session belongs to
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Expiration instant
    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    /// Strategy specific data
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Consume the record, keeping the payload
    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Unique id of this session
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Name of the strategy that created the session
    pub fn strategy(&self) -> &str {
        &self.strategy
    }
}
