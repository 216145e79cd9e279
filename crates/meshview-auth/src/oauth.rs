//! OpenShift OAuth server client
//!
//! The OAuth server advertises itself through the API server at
//! `/.well-known/oauth-authorization-server`. Metadata is fetched once per
//! cluster and cached; tokens are exchanged over plain HTTPS.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use meshview_common::OpenShiftConfig;

use crate::cluster::ClusterError;
use crate::error::{Error, Result};

/// Endpoints of a cluster's OAuth server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OAuthMetadata {
    /// Issuer URL
    pub issuer: String,
    /// Where browsers are sent to log in
    pub authorization_endpoint: String,
    /// Where codes are exchanged for tokens
    pub token_endpoint: String,
}

/// Token endpoint response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OAuthToken {
    /// Access token
    pub access_token: String,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: String,
    /// Refresh token, when issued
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// OAuth operations needed by the OpenShift strategy
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OAuthService: Send + Sync {
    /// OAuth server endpoints of `cluster`
    async fn metadata(&self, cluster: &str) -> Result<OAuthMetadata>;

    /// Exchange an authorization code plus PKCE verifier for a token
    async fn exchange_code(
        &self,
        cluster: &str,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken>;
}

/// [`OAuthService`] for OpenShift clusters
pub struct OpenShiftOAuthService {
    clients: HashMap<String, Client>,
    http: reqwest::Client,
    client_id: String,
    metadata: RwLock<HashMap<String, OAuthMetadata>>,
}

impl OpenShiftOAuthService {
    /// Build from the server's own client for every cluster
    pub fn new(clients: HashMap<String, Client>, config: &OpenShiftConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.insecure_skip_verify_tls)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            clients,
            http,
            client_id: config.client_id(),
            metadata: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl OAuthService for OpenShiftOAuthService {
    async fn metadata(&self, cluster: &str) -> Result<OAuthMetadata> {
        if let Some(metadata) = self.metadata.read().await.get(cluster) {
            return Ok(metadata.clone());
        }

        let client = self
            .clients
            .get(cluster)
            .ok_or_else(|| ClusterError::UnknownCluster(cluster.to_string()))?;
        let request = http::Request::get("/.well-known/oauth-authorization-server")
            .body(Vec::new())
            .map_err(|e| Error::Internal(e.to_string()))?;
        let metadata: OAuthMetadata = client
            .request(request)
            .await
            .map_err(|e| Error::Provider(format!("cannot discover OAuth server: {e}")))?;

        debug!(
            cluster = %cluster,
            issuer = %metadata.issuer,
            "Discovered OAuth server"
        );
        self.metadata
            .write()
            .await
            .insert(cluster.to_string(), metadata.clone());
        Ok(metadata)
    }

    async fn exchange_code(
        &self,
        cluster: &str,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken> {
        let metadata = self.metadata(cluster).await?;
        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.client_id.as_str()),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Provider(format!(
                "token endpoint answered with status {status}"
            )));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_parsing() {
        let token: OAuthToken = serde_json::from_str(
            r#"{"access_token":"sha256~abc","token_type":"Bearer","expires_in":86400,"scope":"user:full"}"#,
        )
        .unwrap();
        assert_eq!(token.access_token, "sha256~abc");
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.expires_in, Some(86400));
        assert_eq!(token.refresh_token, None);
    }

    #[test]
    fn test_metadata_parsing_ignores_extra_fields() {
        let metadata: OAuthMetadata = serde_json::from_str(
            r#"{
                "issuer": "https://oauth.apps.example.com",
                "authorization_endpoint": "https://oauth.apps.example.com/oauth/authorize",
                "token_endpoint": "https://oauth.apps.example.com/oauth/token",
                "code_challenge_methods_supported": ["plain", "S256"]
            }"#,
        )
        .unwrap();
        assert_eq!(
            metadata.token_endpoint,
            "https://oauth.apps.example.com/oauth/token"
        );
    }

    #[tokio::test]
    async fn test_unknown_cluster_metadata() {
        let service =
            OpenShiftOAuthService::new(HashMap::new(), &OpenShiftConfig::default()).unwrap();
        let err = service.metadata("nowhere").await.unwrap_err();
        assert!(matches!(err, Error::Cluster(ClusterError::UnknownCluster(_))));
    }
}
