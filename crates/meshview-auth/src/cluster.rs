//! Cluster API capability
//!
//! Controllers never talk to Kubernetes directly. They go through
//! [`ClusterApi`], which is implemented against real clusters by
//! [`KubeClusterApi`] and mocked in tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA256};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::{HeaderName, HeaderValue};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use meshview_common::AUDIT_USER_HEADER;

/// Failure reported by a cluster API call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClusterError {
    /// Credential was rejected (HTTP 401)
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credential lacks permission (HTTP 403)
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Cluster is not configured
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// Cluster could not be reached
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    /// Any other API failure
    #[error("{0}")]
    Api(String),
}

impl ClusterError {
    /// Whether the cluster rejected the credential itself
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClusterError::Unauthorized(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 401 => ClusterError::Unauthorized(ae.message),
            kube::Error::Api(ae) if ae.code == 403 => ClusterError::Forbidden(ae.message),
            kube::Error::Api(ae) => ClusterError::Api(ae.message),
            other => ClusterError::Unreachable(other.to_string()),
        }
    }
}

/// Credential material for acting on a cluster as the user
#[derive(Clone, Default, PartialEq)]
pub struct AuthInfo {
    /// Bearer token
    pub token: String,
    /// `Impersonate-User`
    pub impersonate: Option<String>,
    /// `Impersonate-Group`, repeatable
    pub impersonate_groups: Vec<String>,
    /// `Impersonate-Extra-<name>`, repeatable
    pub impersonate_extra: BTreeMap<String, Vec<String>>,
    /// Username sent along for audit logging
    pub audit_user: Option<String>,
}

impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo")
            .field("token", &"[redacted]")
            .field("impersonate", &self.impersonate)
            .field("impersonate_groups", &self.impersonate_groups)
            .field("impersonate_extra", &self.impersonate_extra)
            .field("audit_user", &self.audit_user)
            .finish()
    }
}

impl AuthInfo {
    /// Plain bearer token credential
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }
}

/// Outcome of a TokenReview
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenReviewResult {
    /// Whether the API server recognized the token
    pub authenticated: bool,
    /// Username the token maps to
    pub username: Option<String>,
    /// Error reported by the authenticator
    pub error: Option<String>,
}

/// Operations the authentication layer needs from a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of the namespaces visible to the credential
    ///
    /// Used as the liveness and privilege check for bearer tokens.
    async fn list_namespaces(
        &self,
        cluster: &str,
        auth: &AuthInfo,
    ) -> Result<Vec<String>, ClusterError>;

    /// Review `token` with the server's own identity
    async fn review_token(
        &self,
        cluster: &str,
        token: &str,
    ) -> Result<TokenReviewResult, ClusterError>;

    /// Name of the OpenShift user owning `token`
    async fn user_info(&self, cluster: &str, token: &str) -> Result<String, ClusterError>;

    /// Delete the OpenShift OAuth access token
    async fn revoke_token(&self, cluster: &str, token: &str) -> Result<(), ClusterError>;

    /// Credential of the server itself, when it has one
    fn service_auth(&self, cluster: &str) -> Option<AuthInfo>;
}

/// Name of the `oauthaccesstokens` object backing an OpenShift token
pub fn openshift_token_name(token: &str) -> String {
    let hash = digest(&SHA256, token.as_bytes());
    format!("sha256~{}", URL_SAFE_NO_PAD.encode(hash.as_ref()))
}

#[derive(Deserialize)]
struct OpenShiftUser {
    metadata: ObjectMeta,
}

/// [`ClusterApi`] backed by kube clients
///
/// Holds one base `kube::Config` per cluster. Calls made for a user get a
/// fresh client derived from that config with the user's token; calls made
/// for the server reuse a client built once from the config as is.
pub struct KubeClusterApi {
    configs: HashMap<String, kube::Config>,
    service_clients: HashMap<String, Client>,
}

impl KubeClusterApi {
    /// Build from per-cluster base configurations
    pub fn new(configs: HashMap<String, kube::Config>) -> Result<Self, ClusterError> {
        let mut service_clients = HashMap::with_capacity(configs.len());
        for (name, config) in &configs {
            let client = Client::try_from(config.clone())
                .map_err(|e| ClusterError::Api(format!("client for {name}: {e}")))?;
            service_clients.insert(name.clone(), client);
        }
        Ok(Self {
            configs,
            service_clients,
        })
    }

    /// Clients acting as the server itself, by cluster
    pub fn service_clients(&self) -> HashMap<String, Client> {
        self.service_clients.clone()
    }

    fn config(&self, cluster: &str) -> Result<&kube::Config, ClusterError> {
        self.configs
            .get(cluster)
            .ok_or_else(|| ClusterError::UnknownCluster(cluster.to_string()))
    }

    fn service_client(&self, cluster: &str) -> Result<Client, ClusterError> {
        self.service_clients
            .get(cluster)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownCluster(cluster.to_string()))
    }

    fn user_client(&self, cluster: &str, auth: &AuthInfo) -> Result<Client, ClusterError> {
        let mut config = self.config(cluster)?.clone();
        config.auth_info = kube::config::AuthInfo {
            token: Some(SecretString::from(auth.token.clone())),
            impersonate: auth.impersonate.clone(),
            impersonate_groups: (!auth.impersonate_groups.is_empty())
                .then(|| auth.impersonate_groups.clone()),
            ..Default::default()
        };

        for (key, values) in &auth.impersonate_extra {
            let name = format!("impersonate-extra-{}", key.to_ascii_lowercase());
            let Ok(name) = HeaderName::try_from(name) else {
                warn!(key = %key, "Skipping invalid impersonation extra");
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    config.headers.push((name.clone(), value));
                }
            }
        }
        if let Some(user) = &auth.audit_user {
            if let Ok(value) = HeaderValue::from_str(user) {
                config
                    .headers
                    .push((HeaderName::from_static(AUDIT_USER_HEADER), value));
            }
        }

        Client::try_from(config).map_err(|e| ClusterError::Api(e.to_string()))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_namespaces(
        &self,
        cluster: &str,
        auth: &AuthInfo,
    ) -> Result<Vec<String>, ClusterError> {
        let client = self.user_client(cluster, auth)?;
        let api: Api<Namespace> = Api::all(client);
        let list = api.list(&ListParams::default()).await?;
        let names: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect();
        debug!(cluster = %cluster, count = names.len(), "Listed namespaces");
        Ok(names)
    }

    async fn review_token(
        &self,
        cluster: &str,
        token: &str,
    ) -> Result<TokenReviewResult, ClusterError> {
        let api: Api<TokenReview> = Api::all(self.service_client(cluster)?);
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = api.create(&PostParams::default(), &review).await?;
        let status = result.status.unwrap_or_default();
        Ok(TokenReviewResult {
            authenticated: status.authenticated.unwrap_or(false),
            username: status.user.and_then(|u| u.username),
            error: status.error,
        })
    }

    async fn user_info(&self, cluster: &str, token: &str) -> Result<String, ClusterError> {
        let client = self.user_client(cluster, &AuthInfo::bearer(token))?;
        let request = http::Request::get("/apis/user.openshift.io/v1/users/~")
            .body(Vec::new())
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        let user: OpenShiftUser = client.request(request).await?;
        user.metadata
            .name
            .ok_or_else(|| ClusterError::Api("user object has no name".into()))
    }

    async fn revoke_token(&self, cluster: &str, token: &str) -> Result<(), ClusterError> {
        let client = self.user_client(cluster, &AuthInfo::bearer(token))?;
        let path = format!(
            "/apis/oauth.openshift.io/v1/oauthaccesstokens/{}",
            openshift_token_name(token)
        );
        let request = http::Request::delete(path)
            .body(Vec::new())
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        client.request_text(request).await?;
        debug!(cluster = %cluster, "Revoked OAuth access token");
        Ok(())
    }

    fn service_auth(&self, cluster: &str) -> Option<AuthInfo> {
        let auth = &self.configs.get(cluster)?.auth_info;
        if let Some(token) = &auth.token {
            return Some(AuthInfo::bearer(token.expose_secret()));
        }
        // In-cluster configs point at the mounted service account token
        let path = auth.token_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(token) => Some(AuthInfo::bearer(token.trim())),
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Cannot read service account token");
                None
            }
        }
    }
}
