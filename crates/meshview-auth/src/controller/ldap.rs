//! LDAP strategy
//!
//! Directory credentials are exchanged for a bearer token by an
//! [`LdapAuthenticator`]; from there on the session is handled exactly like a
//! token session, except that it is tagged with the `ldap` strategy.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::token::TokenController;
use super::{UserSessionData, UserSessions};
use crate::error::{Error, Result};
use crate::request::AuthRequest;
use crate::session::SessionJar;

/// Result of a successful directory bind
#[derive(Debug, Clone, PartialEq)]
pub struct LdapIdentity {
    /// Bearer token to use against the cluster
    pub token: String,
    /// Directory user name
    pub username: String,
}

/// Exchanges directory credentials for a cluster bearer token
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LdapAuthenticator: Send + Sync {
    /// Bind as `username` and resolve the token mapped to that user
    async fn authenticate(&self, username: &str, password: &str) -> Result<LdapIdentity>;
}

/// Controller for the `ldap` strategy
pub struct LdapController {
    directory: std::sync::Arc<dyn LdapAuthenticator>,
    tokens: TokenController,
}

impl LdapController {
    /// Wrap a token controller whose store is tagged `ldap`
    pub fn new(directory: std::sync::Arc<dyn LdapAuthenticator>, tokens: TokenController) -> Self {
        Self { directory, tokens }
    }

    /// Log in with the `username` and `password` form fields
    pub async fn authenticate(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessionData> {
        let cluster = self.tokens.target_cluster(req)?;
        let username = req.form_value("username").unwrap_or_default().trim();
        let password = req.form_value("password").unwrap_or_default();
        if username.is_empty() || password.is_empty() {
            self.tokens.reject(jar, &cluster);
            return Err(Error::auth_failure(
                axum::http::StatusCode::BAD_REQUEST,
                "username and password are required",
                "empty credentials",
            ));
        }

        let identity = match self.directory.authenticate(username, password).await {
            Ok(identity) => identity,
            Err(e) => {
                self.tokens.reject(jar, &cluster);
                return Err(e);
            }
        };

        self.tokens
            .login(jar, &cluster, &identity.token, Some(identity.username))
            .await
    }

    /// Same as the token strategy
    pub async fn validate_session(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessions> {
        self.tokens.validate_session(req, jar).await
    }

    /// Same as the token strategy
    pub fn terminate_session(&self, jar: &mut SessionJar) {
        self.tokens.terminate_session(jar)
    }
}
