//! OpenID Connect strategy
//!
//! # Flow
//!
//! ```text
//! browser ──► /api/auth/openid_redirect
//!               session-nonce, session-pkce-verifier; 302 to the provider
//! provider ──► <web root>?code=...&state=...
//!               state check ──► code + verifier ──► id_token
//!               claims, nonce, domains ──► RBAC or local checks ──► session
//! ```
//!
//! The callback lands on the web root. Requests there that do not look like
//! a callback of this server are declined and served by the next handler.

pub mod claims;
pub mod flow;
pub mod provider;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::StatusCode;
use axum_extra::extract::cookie::SameSite;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use meshview_common::{ApiToken, Clock, ClustersConfig, OpenIdConfig};

use crate::cluster::{AuthInfo, ClusterApi};
use crate::controller::{revalidated, terminate_all, UserSessionData, UserSessions};
use crate::error::{Error, Result};
use crate::jwt::{unverified_claims, Claims};
use crate::pkce;
use crate::request::AuthRequest;
use crate::session::{CookieSessionStore, SessionJar};

pub use provider::{HttpOpenIdProvider, OpenIdProvider, ProviderMetadata, TokenResponse};

/// Query parameter carrying a callback failure
pub const OPENID_ERROR_PARAM: &str = "openid_error";

/// Session payload of the OpenID strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenIdPayload {
    /// Resolved username
    pub subject: String,
    /// Token presented to the cluster API
    pub token: String,
}

/// Static settings of the OpenID strategy
#[derive(Debug)]
pub struct OpenIdSettings {
    /// Client id registered at the provider
    pub client_id: String,
    /// Claim holding the username
    pub username_claim: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Extra authorization URL parameters
    pub additional_params: BTreeMap<String, String>,
    /// Domains allowed to log in
    pub allowed_domains: Vec<String>,
    /// Which provider token goes to the cluster
    pub api_token: ApiToken,
    /// Validate tokens locally instead of through cluster RBAC
    pub disable_rbac: bool,
    /// Lifetime of the nonce and verifier cookies
    pub flow_lifetime: Duration,
    /// Key binding the `state` parameter to this server
    pub signing_key: SecretString,
    /// Web root, for redirects back into the console
    pub web_root: String,
}

impl OpenIdSettings {
    /// Settings from the `auth.openid` section
    pub fn from_config(config: &OpenIdConfig, signing_key: &str, web_root: &str) -> Self {
        Self {
            client_id: config.client_id.clone(),
            username_claim: config.username_claim.clone(),
            scopes: config.effective_scopes(),
            additional_params: config.additional_request_params.clone(),
            allowed_domains: config.allowed_domains.clone(),
            api_token: config.api_token,
            disable_rbac: config.disable_rbac,
            flow_lifetime: Duration::seconds(config.authentication_timeout as i64),
            signing_key: SecretString::from(signing_key.to_string()),
            web_root: web_root.to_string(),
        }
    }
}

/// Values extracted from a callback request
struct Callback {
    nonce: String,
    verifier: Option<String>,
    state: String,
    code: String,
}

/// Controller for the `openid` strategy
pub struct OpenIdController {
    api: Arc<dyn ClusterApi>,
    provider: Arc<dyn OpenIdProvider>,
    store: CookieSessionStore<OpenIdPayload>,
    clusters: ClustersConfig,
    settings: OpenIdSettings,
}

impl OpenIdController {
    /// Build a controller
    pub fn new(
        api: Arc<dyn ClusterApi>,
        provider: Arc<dyn OpenIdProvider>,
        store: CookieSessionStore<OpenIdPayload>,
        clusters: ClustersConfig,
        settings: OpenIdSettings,
    ) -> Self {
        Self {
            api,
            provider,
            store,
            clusters,
            settings,
        }
    }

    fn root(&self) -> String {
        format!("{}/", self.settings.web_root.trim_end_matches('/'))
    }

    fn nonce_cookie(&self) -> String {
        self.store.names().nonce("")
    }

    fn verifier_cookie(&self) -> String {
        self.store.names().code_verifier("")
    }

    /// Authorization endpoint of the provider, for the login page
    pub async fn authorization_endpoint(&self) -> Result<String> {
        Ok(self.provider.metadata().await?.authorization_endpoint)
    }

    /// Start a login: set the flow cookies and return the authorize URL
    pub async fn redirect(&self, req: &AuthRequest, jar: &mut SessionJar) -> Result<String> {
        let metadata = self.provider.metadata().await?;
        let now = self.store.clock().now();

        let nonce = flow::new_nonce();
        let verifier = pkce::code_verifier();
        let state = flow::make_state(
            &nonce,
            &flow::state_timestamp(now),
            self.settings.signing_key.expose_secret(),
        );

        let mut url = Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| Error::Provider(format!("bad authorization endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.settings.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", req.public_url())
                .append_pair("scope", &self.settings.scopes.join(" "))
                .append_pair("nonce", &flow::hashed_nonce(&nonce))
                .append_pair("state", &state)
                .append_pair("code_challenge", &pkce::code_challenge(&verifier))
                .append_pair("code_challenge_method", "S256");
            for (name, value) in &self.settings.additional_params {
                query.append_pair(name, value);
            }
        }

        let expires = now + self.settings.flow_lifetime;
        jar.set(self.nonce_cookie(), nonce, expires, SameSite::Lax);
        jar.set(self.verifier_cookie(), verifier, expires, SameSite::Lax);

        debug!(issuer = %metadata.issuer, "Redirecting to OpenID provider");
        Ok(url.to_string())
    }

    fn callback_params(&self, req: &AuthRequest, jar: &SessionJar) -> Option<Callback> {
        let nonce = jar.get(&self.nonce_cookie()).filter(|n| !n.is_empty())?;
        let state = req.query("state").filter(|s| !s.is_empty())?;
        let code = req.query("code").filter(|c| !c.is_empty())?;
        Some(Callback {
            nonce: nonce.to_string(),
            verifier: jar.get(&self.verifier_cookie()).map(str::to_string),
            state,
            code,
        })
    }

    /// Whether the request carries a provider error for a login of ours
    fn provider_error(&self, req: &AuthRequest, jar: &SessionJar) -> Option<Error> {
        jar.get(&self.nonce_cookie())?;
        let error = req.query("error")?;
        let detail = req.query("error_description").unwrap_or_else(|| error.clone());
        Some(Error::auth_failure(
            StatusCode::UNAUTHORIZED,
            format!("the OpenID provider rejected the login: {error}"),
            detail,
        ))
    }

    fn clear_flow_cookies(&self, jar: &mut SessionJar) {
        for name in [self.nonce_cookie(), self.verifier_cookie()] {
            if jar.get(&name).is_some() {
                jar.drop_cookie(name);
            }
        }
    }

    /// Run the callback and tell the browser where to go next
    ///
    /// `None` means the request is not a callback of this server.
    pub async fn handle_callback(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Option<String> {
        let result = if let Some(error) = self.provider_error(req, jar) {
            self.clear_flow_cookies(jar);
            self.store.terminate_session(jar, &self.clusters.home);
            Err(error)
        } else {
            if self.callback_params(req, jar).is_none() {
                debug!(path = %req.path(), "Not an OpenID callback");
                return None;
            }
            self.authenticate(req, jar).await
        };

        Some(match result {
            Ok(user) => {
                info!(username = %user.username, "OpenID login completed");
                self.root()
            }
            Err(e) => {
                warn!(error = %e, "OpenID login failed");
                format!(
                    "{}?{OPENID_ERROR_PARAM}={}",
                    self.root(),
                    urlencoding::encode(&e.to_string())
                )
            }
        })
    }

    /// Callback leg: check the flow values, exchange the code, create the session
    pub async fn authenticate(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessionData> {
        let callback = self
            .callback_params(req, jar)
            .ok_or_else(|| Error::BadRequest("not an OpenID callback".into()))?;
        self.clear_flow_cookies(jar);

        let home = self.clusters.home.clone();
        let result = self.complete_login(req, jar, &home, callback).await;
        if result.is_err() {
            self.store.terminate_session(jar, &home);
        }
        result
    }

    async fn complete_login(
        &self,
        req: &AuthRequest,
        jar: &mut SessionJar,
        cluster: &str,
        callback: Callback,
    ) -> Result<UserSessionData> {
        flow::verify_state(
            &callback.state,
            &callback.nonce,
            self.settings.signing_key.expose_secret(),
        )
        .map_err(|e| {
            Error::auth_failure(StatusCode::FORBIDDEN, "request rejected: CSRF mitigation", e)
        })?;

        let verifier = callback.verifier.ok_or_else(|| {
            Error::auth_failure(
                StatusCode::UNAUTHORIZED,
                "the PKCE code verifier is missing",
                "the login was started by an older console or the flow cookies expired; log in again",
            )
        })?;

        let tokens = self
            .provider
            .exchange_code(&callback.code, &verifier, req.public_url())
            .await?;

        let claims = unverified_claims(&tokens.id_token)?;
        let expires_on = claims::expiration(&claims)?;
        let subject = claims::username(&claims, &self.settings.username_claim);
        claims::check_nonce(&claims, &flow::hashed_nonce(&callback.nonce))?;
        claims::check_allowed_domains(&claims, &self.settings.allowed_domains)?;

        let (token, auth) = if self.settings.disable_rbac {
            self.validate_in_house(&tokens.id_token, &claims).await?;
            (tokens.id_token, self.service_auth(cluster)?)
        } else {
            let token = self.api_token(tokens)?;
            let auth = AuthInfo::bearer(token.clone());
            self.check_privileges(cluster, &auth).await?;
            (token, auth)
        };

        let data = self.store.new_session(
            cluster,
            expires_on,
            OpenIdPayload {
                subject: subject.clone(),
                token,
            },
        )?;
        self.store.create_session(jar, &data)?;

        Ok(UserSessionData {
            auth: AuthInfo {
                audit_user: Some(subject.clone()),
                ..auth
            },
            username: subject,
            expires_on,
        })
    }

    fn api_token(&self, tokens: TokenResponse) -> Result<String> {
        match self.settings.api_token {
            ApiToken::IdToken => Ok(tokens.id_token),
            ApiToken::AccessToken => tokens.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
                Error::unauthorized("the OpenID provider did not issue an access_token")
            }),
        }
    }

    async fn check_privileges(&self, cluster: &str, auth: &AuthInfo) -> Result<()> {
        let namespaces = self.api.list_namespaces(cluster, auth).await.map_err(|e| {
            Error::auth_failure(
                StatusCode::UNAUTHORIZED,
                "token is not valid or is expired",
                e,
            )
        })?;
        if namespaces.is_empty() {
            return Err(Error::unauthorized("not enough privileges to login"));
        }
        Ok(())
    }

    /// Checks the cluster would otherwise do for us
    async fn validate_in_house(&self, id_token: &str, claims: &Claims) -> Result<()> {
        let rejected = |e: Error| {
            let detail = match e {
                Error::AuthenticationFailure {
                    detail: Some(detail),
                    ..
                } => detail,
                other => other.to_string(),
            };
            Error::auth_failure(StatusCode::FORBIDDEN, "the OpenID token was rejected", detail)
        };

        let metadata = self.provider.metadata().await?;
        claims::check_registered_claims(
            claims,
            &metadata.issuer,
            &self.settings.client_id,
            self.store.clock().now(),
        )
        .map_err(rejected)?;

        let header = jsonwebtoken::decode_header(id_token)?;
        let jwk = self.provider.signing_key(header.kid.clone()).await?;
        claims::verify_signature(id_token, &header, &jwk).map_err(rejected)
    }

    fn service_auth(&self, cluster: &str) -> Result<AuthInfo> {
        self.api.service_auth(cluster).ok_or_else(|| {
            Error::Internal(format!("no service account credential for cluster {cluster}"))
        })
    }

    /// Identity from the home cluster session
    pub async fn validate_session(
        &self,
        _req: &AuthRequest,
        jar: &mut SessionJar,
    ) -> Result<UserSessions> {
        let home = self.clusters.home.clone();
        let session = self.store.read_session(jar, &home)?;
        let expires_on = session.expires_on();
        let payload = session.into_payload();

        if payload.token.is_empty() {
            self.store.terminate_session(jar, &home);
            return Err(Error::SessionNotFound("the session holds no token".into()));
        }

        // An access token is opaque; only an id_token can be cross-checked
        if self.settings.api_token == ApiToken::IdToken {
            if let Err(reason) = self.subject_matches(&payload) {
                warn!(reason = %reason, "Discarding OpenID session");
                self.store.terminate_session(jar, &home);
                return Err(Error::SessionNotFound(reason));
            }
        }

        let auth = if self.settings.disable_rbac {
            self.service_auth(&home)?
        } else {
            let auth = AuthInfo::bearer(payload.token.clone());
            let check = self
                .api
                .list_namespaces(&home, &auth)
                .await
                .map(|_| UserSessionData {
                    username: payload.subject.clone(),
                    expires_on,
                    auth: auth.clone(),
                });
            if revalidated(&self.store, jar, &home, check).is_none() {
                return Err(Error::SessionNotFound(format!(
                    "the OpenID token was not accepted by cluster {home}"
                )));
            }
            auth
        };

        let mut sessions = UserSessions::new();
        sessions.insert(
            home,
            UserSessionData {
                auth: AuthInfo {
                    audit_user: Some(payload.subject.clone()),
                    ..auth
                },
                username: payload.subject,
                expires_on,
            },
        );
        Ok(sessions)
    }

    fn subject_matches(&self, payload: &OpenIdPayload) -> std::result::Result<(), String> {
        let claims = unverified_claims(&payload.token).map_err(|e| e.to_string())?;
        match claims.get(&self.settings.username_claim) {
            Some(claim) if crate::jwt::claim_as_string(claim).as_deref() != Some(&payload.subject) => {
                Err("subject claim mismatch".into())
            }
            _ => Ok(()),
        }
    }

    /// Drop the session and any login still in flight
    pub fn terminate_session(&self, jar: &mut SessionJar) {
        self.clear_flow_cookies(jar);
        terminate_all(&self.store, jar);
    }

    /// When the stored session ends, if one is readable
    pub fn session_expiry(&self, jar: &mut SessionJar) -> Option<DateTime<Utc>> {
        self.store
            .read_session(jar, &self.clusters.home)
            .ok()
            .map(|s| s.expires_on())
    }
}
