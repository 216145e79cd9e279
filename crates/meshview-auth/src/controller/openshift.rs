//! OpenShift OAuth strategy
//!
//! # Flow
//!
//! ```text
//! browser ──► /api/auth/openshift_redirect/{cluster}
//!               sets session-nonce = PKCE verifier, 302 to the OAuth server
//! OAuth server ──► /api/auth/callback/{cluster}?code=...
//!               code + verifier ──► access token ──► session cookies
//! ```
//!
//! Requests may also carry an access token owned by someone else, either as
//! `Authorization: Bearer` or as an `oauth_token` query parameter. Such tokens
//! take priority over cookies and are never written to a session.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use axum_extra::extract::cookie::SameSite;
use meshview_common::{Clock, ClustersConfig};

use super::{collect_sessions, revalidated, UserSessionData, UserSessions};
use crate::cluster::{AuthInfo, ClusterApi};
use crate::error::{Error, Result};
use crate::oauth::OAuthService;
use crate::pkce;
use crate::request::AuthRequest;
use crate::session::{CookieSessionStore, SessionJar};

/// Query parameter carrying a third-party access token
pub const OAUTH_TOKEN_PARAM: &str = "oauth_token";

/// Query parameter carrying a callback failure
pub const OPENSHIFT_ERROR_PARAM: &str = "openshift_error";

/// Session payload of the OpenShift strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenShiftPayload {
    /// OAuth access token
    pub access_token: String,
    /// Token type, normally `Bearer`
    pub token_type: String,
    /// Refresh token, when the server issued one
    pub refresh_token: Option<String>,
    /// When the access token expires
    pub expiry: DateTime<Utc>,
}

/// Static settings of the OpenShift strategy
#[derive(Debug, Clone)]
pub struct OpenShiftSettings {
    /// OAuth client id
    pub client_id: String,
    /// Lifetime of the verifier cookie
    pub nonce_lifetime: Duration,
    /// Session lifetime used when the token does not say
    pub expiration: Duration,
    /// Web root, for redirects back into the console
    pub web_root: String,
}

/// Controller for the `openshift` strategy
pub struct OpenShiftController {
    api: Arc<dyn ClusterApi>,
    oauth: Arc<dyn OAuthService>,
    store: CookieSessionStore<OpenShiftPayload>,
    clusters: ClustersConfig,
    settings: OpenShiftSettings,
}

impl OpenShiftController {
    /// Build a controller
    pub fn new(
        api: Arc<dyn ClusterApi>,
        oauth: Arc<dyn OAuthService>,
        store: CookieSessionStore<OpenShiftPayload>,
        clusters: ClustersConfig,
        settings: OpenShiftSettings,
    ) -> Self {
        Self {
            api,
            oauth,
            store,
            clusters,
            settings,
        }
    }

    fn known_cluster(&self, cluster: Option<&str>) -> Result<String> {
        match cluster {
            Some(c) if self.clusters.contains(c) => Ok(c.to_string()),
            Some(c) => Err(Error::BadRequest(format!("cluster [{c}] is not configured"))),
            None => Err(Error::BadRequest("no cluster in request path".into())),
        }
    }

    fn callback_uri(req: &AuthRequest, cluster: &str) -> String {
        format!("{}/api/auth/callback/{}", req.public_url(), cluster)
    }

    /// Start a login: remember a PKCE verifier and return the authorize URL
    pub async fn redirect(&self, req: &AuthRequest, jar: &mut SessionJar) -> Result<String> {
        let cluster = self.known_cluster(req.cluster())?;
        let metadata = self.oauth.metadata(&cluster).await?;

        let verifier = pkce::code_verifier();
        let mut url = Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| Error::Provider(format!("bad authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &Self::callback_uri(req, &cluster))
            .append_pair("response_type", "code")
            .append_pair("code_challenge", &pkce::code_challenge(&verifier))
            .append_pair("code_challenge_method", "S256");

        let expires = self.store.clock().now() + self.settings.nonce_lifetime;
        jar.set(
            self.store.names().nonce(&cluster),
            verifier,
            expires,
            SameSite::Lax,
        );

        debug!(cluster = %cluster, "Redirecting to OAuth server");
        Ok(url.to_string())
    }

    /// Callback leg: exchange the code and create the session
    pub async fn authenticate(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessionData> {
        let cluster = self.known_cluster(req.cluster())?;
        let nonce_cookie = self.store.names().nonce(&cluster);
        let verifier = jar.get(&nonce_cookie).map(str::to_string);
        if verifier.is_some() {
            jar.drop_cookie(nonce_cookie);
        }

        let result = self.exchange(req, jar, &cluster, verifier).await;
        if result.is_err() {
            self.store.terminate_session(jar, &cluster);
        }
        result
    }

    async fn exchange(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
        cluster: &str,
        verifier: Option<String>,
    ) -> Result<UserSessionData> {
        if let Some(error) = req.query("error") {
            let detail = req.query("error_description").unwrap_or_default();
            return Err(Error::auth_failure(
                axum::http::StatusCode::UNAUTHORIZED,
                format!("login was rejected by the OAuth server: {error}"),
                detail,
            ));
        }
        let code = req
            .query("code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::BadRequest("callback has no authorization code".into()))?;
        let verifier = verifier.ok_or_else(|| {
            Error::unauthorized("the login flow expired or was started elsewhere; log in again")
        })?;

        let token = self
            .oauth
            .exchange_code(cluster, &code, &verifier, &Self::callback_uri(req, cluster))
            .await?;

        let username = self
            .api
            .user_info(cluster, &token.access_token)
            .await
            .map_err(|e| {
                Error::auth_failure(
                    axum::http::StatusCode::UNAUTHORIZED,
                    "cannot resolve the OpenShift user",
                    e,
                )
            })?;

        let now = self.store.clock().now();
        let expiry = token
            .expires_in
            .map(Duration::seconds)
            .unwrap_or(self.settings.expiration);
        let expires_on = now + expiry;
        let data = self.store.new_session(
            cluster,
            expires_on,
            OpenShiftPayload {
                access_token: token.access_token.clone(),
                token_type: token.token_type,
                refresh_token: token.refresh_token,
                expiry: expires_on,
            },
        )?;
        self.store.create_session(jar, &data)?;

        Ok(UserSessionData {
            auth: AuthInfo {
                token: token.access_token,
                audit_user: Some(username.clone()),
                ..Default::default()
            },
            username,
            expires_on,
        })
    }

    /// Run the callback and tell the browser where to go next
    pub async fn handle_callback(&self, req: &AuthRequest, jar: &mut SessionJar) -> String {
        let root = format!("{}/", self.settings.web_root.trim_end_matches('/'));
        match self.authenticate(req, jar).await {
            Ok(user) => {
                info!(username = %user.username, "OpenShift login completed");
                root
            }
            Err(e) => {
                warn!(error = %e, "OpenShift login failed");
                format!(
                    "{root}?{OPENSHIFT_ERROR_PARAM}={}&cluster={}",
                    urlencoding::encode(&e.to_string()),
                    urlencoding::encode(req.cluster().unwrap_or_default())
                )
            }
        }
    }

    /// Identity from a third-party token, else from every cookie session
    pub async fn validate_session(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessions> {
        let third_party = req
            .bearer_token()
            .map(str::to_string)
            .or_else(|| req.query(OAUTH_TOKEN_PARAM).filter(|t| !t.is_empty()));
        if let Some(token) = third_party {
            return self.validate_third_party(&token).await;
        }

        let sessions = self.store.read_all_sessions(jar)?;
        let mut valid = UserSessions::new();
        for session in sessions {
            let key = session.key().to_string();
            if !self.clusters.contains(&key) {
                self.store.terminate_session(jar, &key);
                continue;
            }
            let expires_on = session.expires_on();
            let token = session.into_payload().access_token;
            let check = self
                .api
                .user_info(&key, &token)
                .await
                .map(|username| UserSessionData {
                    auth: AuthInfo {
                        token,
                        audit_user: Some(username.clone()),
                        ..Default::default()
                    },
                    username,
                    expires_on,
                });
            if let Some(user) = revalidated(&self.store, jar, &key, check) {
                valid.insert(key, user);
            }
        }

        if !valid.contains_key(&self.clusters.home) {
            return Err(Error::SessionNotFound(format!(
                "no valid session for home cluster {}",
                self.clusters.home
            )));
        }
        collect_sessions(valid)
    }

    async fn validate_third_party(&self, token: &str) -> Result<UserSessions> {
        let home = self.clusters.home.clone();
        let username = self.api.user_info(&home, token).await.map_err(|e| {
            if e.is_unauthorized() {
                Error::SessionNotFound(format!("third-party token rejected: {e}"))
            } else {
                Error::Cluster(e)
            }
        })?;

        let mut sessions = UserSessions::new();
        sessions.insert(
            home,
            UserSessionData {
                auth: AuthInfo {
                    token: token.to_string(),
                    audit_user: Some(username.clone()),
                    ..Default::default()
                },
                username,
                expires_on: self.store.clock().now() + self.settings.expiration,
            },
        );
        Ok(sessions)
    }

    /// Revoke every cookie session's token, dropping cookies as revocation succeeds
    ///
    /// A session whose token could not be revoked stays in place and the call
    /// fails, so the browser can retry.
    pub async fn terminate_session(&self, _req: &AuthRequest, jar: &mut SessionJar) -> Result<()> {
        let sessions = match self.store.read_all_sessions(jar) {
            Ok(sessions) => sessions,
            Err(e) if e.is_session_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut failures = Vec::new();
        for session in sessions {
            let key = session.key().to_string();
            match self
                .api
                .revoke_token(&key, &session.payload().access_token)
                .await
            {
                Ok(()) => self.store.terminate_session(jar, &key),
                Err(e) => {
                    warn!(cluster = %key, error = %e, "Cannot revoke OAuth token");
                    failures.push(format!("{key}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::TerminateSession {
                message: format!("could not log out of {}", failures.join(", ")),
                status: axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterError, MockClusterApi};
    use crate::controller::tests::{follow_up, now, test_store};
    use crate::oauth::{MockOAuthService, OAuthMetadata, OAuthToken};
    use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
    use meshview_common::{AuthStrategy, RemoteCluster, ServerConfig};

    fn clusters() -> ClustersConfig {
        ClustersConfig {
            home: "home".into(),
            remote: vec![RemoteCluster {
                name: "east".into(),
                kubeconfig: "/etc/meshview/east".into(),
            }],
        }
    }

    fn metadata() -> OAuthMetadata {
        OAuthMetadata {
            issuer: "https://oauth.example.com".into(),
            authorization_endpoint: "https://oauth.example.com/oauth/authorize".into(),
            token_endpoint: "https://oauth.example.com/oauth/token".into(),
        }
    }

    fn controller(api: MockClusterApi, oauth: MockOAuthService) -> OpenShiftController {
        OpenShiftController::new(
            Arc::new(api),
            Arc::new(oauth),
            test_store(true, AuthStrategy::Openshift),
            clusters(),
            OpenShiftSettings {
                client_id: "meshview-istio-system".into(),
                nonce_lifetime: Duration::seconds(300),
                expiration: Duration::hours(24),
                web_root: "/console".into(),
            },
        )
    }

    fn request(uri: &'static str, headers: HeaderMap, cluster: &str) -> AuthRequest {
        let server = ServerConfig {
            web_root: "/console".into(),
            ..Default::default()
        };
        let mut headers = headers;
        headers.insert("host", HeaderValue::from_static("console.example.com:443"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        AuthRequest::new(&server, headers, Uri::from_static(uri)).with_cluster(cluster)
    }

    fn write_session(controller: &OpenShiftController, jar: &mut SessionJar, key: &str) {
        let data = controller
            .store
            .new_session(
                key,
                now() + Duration::hours(1),
                OpenShiftPayload {
                    access_token: format!("{key}-token"),
                    token_type: "Bearer".into(),
                    refresh_token: None,
                    expiry: now() + Duration::hours(1),
                },
            )
            .unwrap();
        controller.store.create_session(jar, &data).unwrap();
    }

    fn sessions_request(controller: &OpenShiftController, keys: &[&str]) -> AuthRequest {
        let mut writer = SessionJar::from_headers(&HeaderMap::new(), "/", false);
        for key in keys {
            write_session(controller, &mut writer, key);
        }
        follow_up(&ServerConfig::default(), &writer)
    }

    #[tokio::test]
    async fn test_redirect_sets_verifier_and_challenge() {
        let mut oauth = MockOAuthService::new();
        oauth.expect_metadata().returning(|_| Ok(metadata()));
        let controller = controller(MockClusterApi::new(), oauth);

        let req = request("/console/api/auth/openshift_redirect/east", HeaderMap::new(), "east");
        let mut jar = req.jar();
        let location = controller.redirect(&req, &mut jar).await.unwrap();

        let cookie = jar.pending_cookie("session-nonce-east").unwrap();
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.secure(), Some(true));
        let verifier = cookie.value().to_string();
        assert_eq!(verifier.len(), pkce::CODE_VERIFIER_LEN);

        let url = Url::parse(&location).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["code_challenge"], pkce::code_challenge(&verifier));
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "meshview-istio-system");
        assert_eq!(
            params["redirect_uri"],
            "https://console.example.com/console/api/auth/callback/east"
        );
    }

    #[tokio::test]
    async fn test_callback_creates_session_and_clears_nonce() {
        let mut oauth = MockOAuthService::new();
        oauth
            .expect_exchange_code()
            .withf(|cluster, code, verifier, _| {
                cluster == "home" && code == "the-code" && verifier == "the-verifier"
            })
            .returning(|_, _, _, _| {
                Ok(OAuthToken {
                    access_token: "sha256~token".into(),
                    token_type: "Bearer".into(),
                    refresh_token: None,
                    expires_in: Some(600),
                })
            });
        let mut api = MockClusterApi::new();
        api.expect_user_info()
            .returning(|_, _| Ok("alice".to_string()));
        let controller = controller(api, oauth);

        let headers = crate::session::cookies::tests::cookie_headers(&[(
            "session-nonce-home",
            "the-verifier",
        )]);
        let req = request("/console/api/auth/callback/home?code=the-code", headers, "home");
        let mut jar = req.jar();
        let location = controller.handle_callback(&req, &mut jar).await;

        assert_eq!(location, "/console/");
        assert_eq!(jar.pending_cookie("session-nonce-home").unwrap().value(), "");
        let session = controller.store.read_session(&mut jar, "home").unwrap();
        assert_eq!(session.payload().access_token, "sha256~token");
        assert_eq!(session.expires_on(), now() + Duration::seconds(600));
    }

    #[tokio::test]
    async fn test_callback_without_verifier_redirects_with_error() {
        let controller = controller(MockClusterApi::new(), MockOAuthService::new());
        let req = request("/console/api/auth/callback/home?code=c", HeaderMap::new(), "home");
        let mut jar = req.jar();

        let location = controller.handle_callback(&req, &mut jar).await;
        assert!(location.starts_with("/console/?openshift_error="));
        assert!(location.ends_with("&cluster=home"));
    }

    #[tokio::test]
    async fn test_third_party_token_takes_priority() {
        let mut api = MockClusterApi::new();
        api.expect_user_info()
            .withf(|cluster, token| cluster == "home" && token == "external")
            .returning(|_, _| Ok("bob".to_string()));
        let controller = controller(api, MockOAuthService::new());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer external"));
        let req = request("/console/api/auth/session", headers, "home");
        let mut jar = req.jar();
        let sessions = controller.validate_session(&req, &mut jar).await.unwrap();
        assert_eq!(sessions["home"].username, "bob");
        assert!(jar.pending().is_empty());

        let req = request(
            "/console/api/auth/session?oauth_token=external",
            HeaderMap::new(),
            "home",
        );
        let sessions = controller
            .validate_session(&req, &mut req.jar())
            .await
            .unwrap();
        assert_eq!(sessions["home"].auth.token, "external");
    }

    #[tokio::test]
    async fn test_validate_drops_revoked_remote_cluster() {
        let mut api = MockClusterApi::new();
        api.expect_user_info()
            .withf(|cluster, _| cluster == "home")
            .returning(|_, _| Ok("alice".to_string()));
        api.expect_user_info()
            .withf(|cluster, _| cluster == "east")
            .returning(|_, _| Err(ClusterError::Unauthorized("revoked".into())));
        let controller = controller(api, MockOAuthService::new());

        let req = sessions_request(&controller, &["home", "east"]);
        let mut jar = req.jar();
        let sessions = controller.validate_session(&req, &mut jar).await.unwrap();

        assert_eq!(sessions.keys().collect::<Vec<_>>(), vec!["home"]);
        assert_eq!(jar.pending_cookie("session-east").unwrap().value(), "");
    }

    #[tokio::test]
    async fn test_validate_requires_home_cluster() {
        let mut api = MockClusterApi::new();
        api.expect_user_info()
            .returning(|_, _| Ok("alice".to_string()));
        let controller = controller(api, MockOAuthService::new());

        let req = sessions_request(&controller, &["east"]);
        let err = controller
            .validate_session(&req, &mut req.jar())
            .await
            .unwrap_err();
        assert!(err.is_session_not_found());
    }

    #[tokio::test]
    async fn test_terminate_keeps_session_when_revocation_fails() {
        let mut api = MockClusterApi::new();
        api.expect_revoke_token()
            .withf(|cluster, _| cluster == "home")
            .returning(|_, _| Ok(()));
        api.expect_revoke_token()
            .withf(|cluster, _| cluster == "east")
            .returning(|_, _| Err(ClusterError::Unreachable("down".into())));
        let controller = controller(api, MockOAuthService::new());

        let req = sessions_request(&controller, &["home", "east"]);
        let mut jar = req.jar();
        let err = controller.terminate_session(&req, &mut jar).await.unwrap_err();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(matches!(err, Error::TerminateSession { .. }));
        assert_eq!(jar.pending_cookie("session-home").unwrap().value(), "");
        assert!(jar.pending_cookie("session-east").is_none());
    }

    #[tokio::test]
    async fn test_terminate_without_sessions_is_ok() {
        let controller = controller(MockClusterApi::new(), MockOAuthService::new());
        let req = request("/console/api/logout", HeaderMap::new(), "home");
        let mut jar = req.jar();
        controller.terminate_session(&req, &mut jar).await.unwrap();
        controller.terminate_session(&req, &mut jar).await.unwrap();
        assert!(jar.pending().is_empty());
    }
}
