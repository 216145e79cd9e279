//! Header strategy
//!
//! A fronting proxy authenticates the user and forwards a bearer token, plus
//! optional impersonation headers, on every request. The session only keeps a
//! readable subject name; credentials always come from the headers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use meshview_common::{strip_service_account_prefix, Clock};

use super::{terminate_all, UserSessionData, UserSessions};
use crate::cluster::{AuthInfo, ClusterApi};
use crate::error::{Error, Result};
use crate::request::AuthRequest;
use crate::session::{CookieSessionStore, SessionJar};

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Subject used when nothing better is known
pub const DEFAULT_HEADER_SUBJECT: &str = "header-user";

/// Session payload of the header strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderPayload {
    /// Resolved user name
    pub subject: String,
}

/// Controller for the `header` strategy
pub struct HeaderController {
    api: Arc<dyn ClusterApi>,
    store: CookieSessionStore<HeaderPayload>,
    home_cluster: String,
    expiration: Duration,
}

impl HeaderController {
    /// Build a controller for the home cluster
    pub fn new(
        api: Arc<dyn ClusterApi>,
        store: CookieSessionStore<HeaderPayload>,
        home_cluster: impl Into<String>,
        expiration_seconds: i64,
    ) -> Self {
        Self {
            api,
            store,
            home_cluster: home_cluster.into(),
            expiration: Duration::seconds(expiration_seconds),
        }
    }

    /// Resolve the subject behind the forwarded credentials and remember it
    pub async fn authenticate(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessionData> {
        let result = self.resolve_and_store(req, jar).await;
        if result.is_err() {
            self.store.terminate_session(jar, &self.home_cluster);
        }
        result
    }

    async fn resolve_and_store(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessionData> {
        let mut auth = forwarded_auth(req).ok_or_else(|| {
            Error::unauthorized("an Authorization header with a bearer token is required")
        })?;

        let subject = match &auth.impersonate {
            Some(user) => user.clone(),
            None => self.review_subject(&auth.token).await?,
        };
        auth.audit_user = Some(subject.clone());

        let expires_on = self.store.clock().now() + self.expiration;
        let data = self.store.new_session(
            self.home_cluster.clone(),
            expires_on,
            HeaderPayload {
                subject: subject.clone(),
            },
        )?;
        self.store.create_session(jar, &data)?;

        Ok(UserSessionData {
            username: subject,
            expires_on,
            auth,
        })
    }

    async fn review_subject(&self, token: &str) -> Result<String> {
        let review = self
            .api
            .review_token(&self.home_cluster, token)
            .await
            .map_err(|e| {
                Error::auth_failure(
                    axum::http::StatusCode::UNAUTHORIZED,
                    "token could not be reviewed",
                    e,
                )
            })?;

        if !review.authenticated {
            return Err(Error::AuthenticationFailure {
                status: axum::http::StatusCode::UNAUTHORIZED,
                reason: "token is not valid or is expired".into(),
                detail: review.error,
            });
        }

        Ok(review
            .username
            .map(|u| strip_service_account_prefix(&u).to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_HEADER_SUBJECT.to_string()))
    }

    /// Identity from the forwarded headers, named after the stored subject
    pub async fn validate_session(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessions> {
        let mut auth = forwarded_auth(req).ok_or_else(|| {
            Error::SessionNotFound("request carries no bearer token".into())
        })?;

        let stored = match self.store.read_session(jar, &self.home_cluster) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(reason = %e, "No header session, using headers only");
                None
            }
        };

        let expires_on = stored
            .as_ref()
            .map(|s| s.expires_on())
            .unwrap_or_else(|| self.store.clock().now() + self.expiration);
        let username = stored
            .map(|s| s.into_payload().subject)
            .or_else(|| auth.impersonate.clone())
            .unwrap_or_else(|| DEFAULT_HEADER_SUBJECT.to_string());
        auth.audit_user = Some(username.clone());

        let mut sessions = UserSessions::new();
        sessions.insert(
            self.home_cluster.clone(),
            UserSessionData {
                username,
                expires_on,
                auth,
            },
        );
        Ok(sessions)
    }

    /// Forget the stored subject
    pub fn terminate_session(&self, jar: &mut SessionJar) {
        terminate_all(&self.store, jar);
    }
}

/// Bearer token and impersonation settings forwarded by the proxy
fn forwarded_auth(req: &AuthRequest) -> Option<AuthInfo> {
    let token = req.bearer_token()?.to_string();

    let mut impersonate_extra: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in req.headers() {
        let Some(key) = name.as_str().strip_prefix(IMPERSONATE_EXTRA_PREFIX) else {
            continue;
        };
        if let Ok(value) = value.to_str() {
            impersonate_extra
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    Some(AuthInfo {
        token,
        impersonate: req
            .header(IMPERSONATE_USER)
            .filter(|u| !u.is_empty())
            .map(str::to_string),
        impersonate_groups: req.header_values(IMPERSONATE_GROUP),
        impersonate_extra,
        audit_user: None,
    })
}
