//! Strategy controllers
//!
//! Each authentication strategy turns some credential into sessions and
//! sessions back into identities. The configured strategy is selected once at
//! startup and wrapped in [`AuthController`].
//!
//! Every controller offers the same three operations:
//!
//! - `authenticate`: check fresh credentials and create a session
//! - `validate_session`: rebuild identities from session cookies
//! - `terminate_session`: destroy the sessions carried by the request

pub mod header;
pub mod ldap;
pub mod openshift;
pub mod token;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use meshview_common::AuthStrategy;

use crate::cluster::{AuthInfo, ClusterError};
use crate::error::{Error, Result};
use crate::openid::OpenIdController;
use crate::request::AuthRequest;
use crate::session::{CookieSessionStore, SessionJar};

pub use header::HeaderController;
pub use ldap::{LdapAuthenticator, LdapController};
pub use openshift::OpenShiftController;
pub use token::TokenController;

/// Identity of a logged in user on one cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionData {
    /// Human readable name
    pub username: String,
    /// When the session ends
    pub expires_on: DateTime<Utc>,
    /// Credentials for acting on the cluster as the user
    #[serde(skip)]
    pub auth: AuthInfo,
}

/// Valid sessions of a request, by cluster
pub type UserSessions = BTreeMap<String, UserSessionData>;

/// The configured authentication strategy
pub enum AuthController {
    /// Bearer token submitted through the login form
    Token(TokenController),
    /// Directory credentials exchanged for a bearer token
    Ldap(LdapController),
    /// Credentials injected by a fronting proxy
    Header(HeaderController),
    /// OpenShift OAuth server
    OpenShift(OpenShiftController),
    /// OpenID Connect provider
    OpenId(OpenIdController),
}

impl AuthController {
    /// Strategy served by this controller
    pub fn strategy(&self) -> AuthStrategy {
        match self {
            AuthController::Token(_) => AuthStrategy::Token,
            AuthController::Ldap(_) => AuthStrategy::Ldap,
            AuthController::Header(_) => AuthStrategy::Header,
            AuthController::OpenShift(_) => AuthStrategy::Openshift,
            AuthController::OpenId(_) => AuthStrategy::Openid,
        }
    }

    /// Check fresh credentials and, on success, create a session
    ///
    /// On failure any existing session for the targeted cluster is removed.
    pub async fn authenticate(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessionData> {
        let result = match self {
            AuthController::Token(c) => c.authenticate(req, jar).await,
            AuthController::Ldap(c) => c.authenticate(req, jar).await,
            AuthController::Header(c) => c.authenticate(req, jar).await,
            AuthController::OpenShift(c) => c.authenticate(req, jar).await,
            AuthController::OpenId(c) => c.authenticate(req, jar).await,
        };
        match &result {
            Ok(session) => info!(
                strategy = %self.strategy(),
                username = %session.username,
                "User authenticated"
            ),
            Err(e) => warn!(strategy = %self.strategy(), error = %e, "Authentication rejected"),
        }
        result
    }

    /// Identities of every still valid session on the request
    pub async fn validate_session(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessions> {
        let result = match self {
            AuthController::Token(c) => c.validate_session(req, jar).await,
            AuthController::Ldap(c) => c.validate_session(req, jar).await,
            AuthController::Header(c) => c.validate_session(req, jar).await,
            AuthController::OpenShift(c) => c.validate_session(req, jar).await,
            AuthController::OpenId(c) => c.validate_session(req, jar).await,
        };
        if let Err(e) = &result {
            if e.is_session_not_found() {
                debug!(reason = %e, "No valid session");
            }
        }
        result
    }

    /// Destroy every session on the request
    pub async fn terminate_session(&self, req: &AuthRequest, jar: &mut SessionJar) -> Result<()> {
        let result = match self {
            AuthController::Token(c) => {
                c.terminate_session(jar);
                Ok(())
            }
            AuthController::Ldap(c) => {
                c.terminate_session(jar);
                Ok(())
            }
            AuthController::Header(c) => {
                c.terminate_session(jar);
                Ok(())
            }
            AuthController::OpenShift(c) => c.terminate_session(req, jar).await,
            AuthController::OpenId(c) => {
                c.terminate_session(jar);
                Ok(())
            }
        };
        if result.is_ok() {
            info!(strategy = %self.strategy(), "Sessions terminated");
        }
        result
    }
}

/// Drop the session of every cluster key found on the request
pub(crate) fn terminate_all<P>(store: &CookieSessionStore<P>, jar: &mut SessionJar)
where
    P: serde::Serialize + serde::de::DeserializeOwned,
{
    let keys: Vec<String> = match store.read_all_sessions(jar) {
        Ok(sessions) => sessions.iter().map(|s| s.key().to_string()).collect(),
        Err(_) => Vec::new(),
    };
    for key in keys {
        store.terminate_session(jar, &key);
    }
    // Whatever is left could not be decoded; clear it all the same
    for name in jar.names() {
        if crate::session::CookieNames::is_potential_session(&name)
            || name.starts_with(crate::session::cookies::CHUNKS_COOKIE_NAME)
        {
            jar.drop_cookie(name);
        }
    }
}

/// Result of re-checking one cluster's session
///
/// A cluster rejecting the credential drops that session's cookies; any other
/// failure leaves the cookies alone and just skips the cluster for this
/// request.
pub(crate) fn revalidated<P>(
    store: &CookieSessionStore<P>,
    jar: &mut SessionJar,
    key: &str,
    check: std::result::Result<UserSessionData, ClusterError>,
) -> Option<UserSessionData>
where
    P: serde::Serialize + serde::de::DeserializeOwned,
{
    match check {
        Ok(session) => Some(session),
        Err(e) if e.is_unauthorized() => {
            info!(cluster = %key, error = %e, "Dropping revoked session");
            store.terminate_session(jar, key);
            None
        }
        Err(e) => {
            warn!(cluster = %key, error = %e, "Cannot validate session");
            None
        }
    }
}

/// Turn the collected sessions into a result, failing when none survived
pub(crate) fn collect_sessions(sessions: UserSessions) -> Result<UserSessions> {
    if sessions.is_empty() {
        return Err(Error::SessionNotFound(
            "none of the sessions on the request is valid".into(),
        ));
    }
    Ok(sessions)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use meshview_common::{Clock, FixedClock};

    use super::*;
    use crate::session::{CookieNames, SessionCodec};

    pub(crate) const TEST_KEY: &[u8] = b"meshview67890123";

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 12, 1, 0, 0, 0).unwrap()
    }

    pub(crate) fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(now()))
    }

    pub(crate) fn test_store<P>(multi_cluster: bool, strategy: AuthStrategy) -> CookieSessionStore<P>
    where
        P: serde::Serialize + serde::de::DeserializeOwned,
    {
        CookieSessionStore::new(
            Arc::new(SessionCodec::new(TEST_KEY).unwrap()),
            CookieNames::new(multi_cluster),
            strategy,
            clock(),
        )
    }

    /// Request carrying the cookies a previous response set
    pub(crate) fn follow_up(
        server: &meshview_common::ServerConfig,
        jar: &SessionJar,
    ) -> AuthRequest {
        let cookies: Vec<(String, String)> = jar
            .pending()
            .iter()
            .filter(|c| !c.value().is_empty())
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let refs: Vec<(&str, &str)> = cookies
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        AuthRequest::new(
            server,
            crate::session::cookies::tests::cookie_headers(&refs),
            axum::http::Uri::from_static("/api/auth/session"),
        )
    }

    #[test]
    fn test_collect_sessions_requires_one() {
        assert!(collect_sessions(UserSessions::new())
            .unwrap_err()
            .is_session_not_found());
    }

    #[test]
    fn test_terminate_all_clears_undecodable_cookies() {
        let store = test_store::<String>(true, AuthStrategy::Token);
        let headers = crate::session::cookies::tests::cookie_headers(&[
            ("session-east", "garbage"),
            ("session-chunks-east", "2"),
            ("session-nonce-east", "keep"),
        ]);
        let mut jar = SessionJar::from_headers(&headers, "/", false);
        terminate_all(&store, &mut jar);
        assert_eq!(jar.names(), vec!["session-nonce-east".to_string()]);

        // Second pass has nothing left to do
        let before = jar.pending().len();
        terminate_all(&store, &mut jar);
        assert_eq!(jar.pending().len(), before);
    }
}
