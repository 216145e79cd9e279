//! Token strategy
//!
//! The user pastes a bearer token into the login form. The token is accepted
//! when it can list at least one namespace on the target cluster, and is kept
//! in the session so later requests act on the cluster as that user.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use meshview_common::{Clock, ClustersConfig};

use super::{collect_sessions, revalidated, terminate_all, UserSessionData, UserSessions};
use crate::cluster::{AuthInfo, ClusterApi};
use crate::error::{Error, Result};
use crate::jwt::username_from_token;
use crate::request::AuthRequest;
use crate::session::{CookieSessionStore, SessionJar};

/// Session payload of the token strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Bearer token
    pub token: String,
    /// Name shown for the token
    pub subject: String,
}

/// Controller for the `token` strategy
pub struct TokenController {
    api: Arc<dyn ClusterApi>,
    store: CookieSessionStore<TokenPayload>,
    clusters: ClustersConfig,
    expiration: Duration,
}

impl TokenController {
    /// Build a controller issuing sessions that last `expiration_seconds`
    pub fn new(
        api: Arc<dyn ClusterApi>,
        store: CookieSessionStore<TokenPayload>,
        clusters: ClustersConfig,
        expiration_seconds: i64,
    ) -> Self {
        Self {
            api,
            store,
            clusters,
            expiration: Duration::seconds(expiration_seconds),
        }
    }

    /// Cluster named by the `cluster` form field, defaulting to the home cluster
    pub(crate) fn target_cluster(&self, req: &AuthRequest) -> Result<String> {
        match req.form_value("cluster").filter(|c| !c.is_empty()) {
            None => Ok(self.clusters.home.clone()),
            Some(cluster) if self.clusters.contains(cluster) => Ok(cluster.to_string()),
            Some(cluster) => Err(Error::BadRequest(format!(
                "cluster [{cluster}] is not configured"
            ))),
        }
    }

    /// Log in with the `token` form field
    pub async fn authenticate(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessionData> {
        let cluster = self.target_cluster(req)?;
        let token = req.form_value("token").unwrap_or_default().trim();
        self.login(jar, &cluster, token, None).await
    }

    /// Check `token` against `cluster` and store it in a new session
    ///
    /// The session subject is `subject` when given, else derived from the token.
    pub(crate) async fn login(
        &self,
        jar: &mut SessionJar,
        cluster: &str,
        token: &str,
        subject: Option<String>,
    ) -> Result<UserSessionData> {
        let result = self.check_and_create(jar, cluster, token, subject).await;
        if result.is_err() {
            self.store.terminate_session(jar, cluster);
        }
        result
    }

    /// Remove the session of `cluster` after a failed login
    pub(crate) fn reject(&self, jar: &mut SessionJar, cluster: &str) {
        self.store.terminate_session(jar, cluster);
    }

    async fn check_and_create(
        &self,
        jar: &mut SessionJar,
        cluster: &str,
        token: &str,
        subject: Option<String>,
    ) -> Result<UserSessionData> {
        if token.is_empty() {
            return Err(Error::auth_failure(
                axum::http::StatusCode::BAD_REQUEST,
                "token is empty",
                "a token must be provided to log in",
            ));
        }

        let subject = subject.unwrap_or_else(|| username_from_token(token));
        let auth = AuthInfo {
            token: token.to_string(),
            audit_user: Some(subject.clone()),
            ..Default::default()
        };

        let namespaces = self.api.list_namespaces(cluster, &auth).await.map_err(|e| {
            Error::auth_failure(
                axum::http::StatusCode::UNAUTHORIZED,
                "token is not valid or is expired",
                e,
            )
        })?;
        if namespaces.is_empty() {
            return Err(Error::unauthorized("not enough privileges to login"));
        }

        let expires_on = self.store.clock().now() + self.expiration;
        let data = self.store.new_session(
            cluster,
            expires_on,
            TokenPayload {
                token: token.to_string(),
                subject: subject.clone(),
            },
        )?;
        self.store.create_session(jar, &data)?;

        debug!(cluster = %cluster, namespaces = namespaces.len(), "Token accepted");
        Ok(UserSessionData {
            username: subject,
            expires_on,
            auth,
        })
    }

    /// Re-check every stored token by listing namespaces
    pub async fn validate_session(
        &self,
        _req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessions> {
        let sessions = self.store.read_all_sessions(jar)?;

        let mut valid = UserSessions::new();
        for session in sessions {
            let key = session.key().to_string();
            if !self.clusters.contains(&key) {
                info!(cluster = %key, "Dropping session for unknown cluster");
                self.store.terminate_session(jar, &key);
                continue;
            }

            let expires_on = session.expires_on();
            let payload = session.into_payload();
            let auth = AuthInfo {
                token: payload.token,
                audit_user: Some(payload.subject.clone()),
                ..Default::default()
            };
            let check = self
                .api
                .list_namespaces(&key, &auth)
                .await
                .map(|_| UserSessionData {
                    username: payload.subject,
                    expires_on,
                    auth,
                });
            if let Some(user) = revalidated(&self.store, jar, &key, check) {
                valid.insert(key, user);
            }
        }

        collect_sessions(valid)
    }

    /// Drop every token session on the request
    pub fn terminate_session(&self, jar: &mut SessionJar) {
        terminate_all(&self.store, jar);
    }
}
