//! OpenID provider client
//!
//! Discovery and JWKS documents are fetched lazily and cached for the life of
//! the process. Endpoint overrides from the configuration win over discovery.
//! The JWKS is refetched once when a token names a key id the cache does not
//! know, which covers routine key rotation at the provider.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use meshview_common::OpenIdConfig;

use crate::error::{Error, Result};

/// Subset of the provider's discovery document
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,
    /// Where browsers are sent to log in
    pub authorization_endpoint: String,
    /// Where codes are exchanged for tokens
    pub token_endpoint: String,
    /// Signing key set
    #[serde(default)]
    pub jwks_uri: String,
}

/// Token endpoint response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenResponse {
    /// Signed identity token
    pub id_token: String,
    /// Access token, when issued
    #[serde(default)]
    pub access_token: Option<String>,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime of the access token in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Operations against the OpenID provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OpenIdProvider: Send + Sync {
    /// Provider endpoints
    async fn metadata(&self) -> Result<ProviderMetadata>;

    /// Exchange an authorization code plus PKCE verifier for tokens
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse>;

    /// Key that signed a token, by key id
    async fn signing_key(&self, kid: Option<String>) -> Result<Jwk>;
}

/// [`OpenIdProvider`] talking HTTPS to a real provider
pub struct HttpOpenIdProvider {
    http: reqwest::Client,
    issuer_uri: String,
    client_id: String,
    client_secret: Option<SecretString>,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    jwks_uri: Option<String>,
    metadata: RwLock<Option<ProviderMetadata>>,
    jwks: RwLock<Option<JwkSet>>,
}

impl HttpOpenIdProvider {
    /// Build a client from the `auth.openid` configuration
    pub fn new(config: &OpenIdConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.insecure_skip_verify_tls);

        if let Some(proxy) = config.http_proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(
                reqwest::Proxy::http(proxy)
                    .map_err(|e| Error::Config(format!("invalid http_proxy: {}", e)))?,
            );
        }
        if let Some(proxy) = config.https_proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(
                reqwest::Proxy::https(proxy)
                    .map_err(|e| Error::Config(format!("invalid https_proxy: {}", e)))?,
            );
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            issuer_uri: config.issuer_uri.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: Some(config.client_secret.clone())
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            authorization_endpoint: config.authorization_endpoint.clone(),
            token_endpoint: config.token_endpoint.clone(),
            jwks_uri: config.jwks_uri.clone(),
            metadata: RwLock::new(None),
            jwks: RwLock::new(None),
        })
    }

    /// Forget cached discovery and key documents
    async fn invalidate(&self) {
        *self.metadata.write().await = None;
        *self.jwks.write().await = None;
    }

    fn overrides_complete(&self) -> bool {
        self.authorization_endpoint.is_some()
            && self.token_endpoint.is_some()
            && self.jwks_uri.is_some()
    }

    async fn discover(&self) -> Result<ProviderMetadata> {
        if self.overrides_complete() {
            return Ok(ProviderMetadata {
                issuer: self.issuer_uri.clone(),
                authorization_endpoint: self.authorization_endpoint.clone().unwrap_or_default(),
                token_endpoint: self.token_endpoint.clone().unwrap_or_default(),
                jwks_uri: self.jwks_uri.clone().unwrap_or_default(),
            });
        }

        let url = format!("{}/.well-known/openid-configuration", self.issuer_uri);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Provider(format!(
                "discovery document at {url} answered with status {status}"
            )));
        }
        let mut metadata: ProviderMetadata = response.json().await?;

        if let Some(endpoint) = &self.authorization_endpoint {
            metadata.authorization_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &self.token_endpoint {
            metadata.token_endpoint = endpoint.clone();
        }
        if let Some(uri) = &self.jwks_uri {
            metadata.jwks_uri = uri.clone();
        }

        info!(
            issuer = %metadata.issuer,
            authorization_endpoint = %metadata.authorization_endpoint,
            "Discovered OpenID provider"
        );
        Ok(metadata)
    }

    async fn fetch_jwks(&self) -> Result<JwkSet> {
        let metadata = self.metadata().await?;
        if metadata.jwks_uri.is_empty() {
            return Err(Error::Provider(
                "the provider does not publish a jwks_uri".into(),
            ));
        }
        let response = self.http.get(&metadata.jwks_uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Provider(format!(
                "JWKS endpoint answered with status {status}"
            )));
        }
        let jwks: JwkSet = response.json().await?;
        debug!(keys = jwks.keys.len(), "Fetched provider signing keys");
        *self.jwks.write().await = Some(jwks.clone());
        Ok(jwks)
    }
}

/// Key matching `kid`, or the only key of a single-key set when no kid is given
pub(crate) fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => jwks.find(kid).cloned(),
        None if jwks.keys.len() == 1 => jwks.keys.first().cloned(),
        None => None,
    }
}

#[async_trait]
impl OpenIdProvider for HttpOpenIdProvider {
    async fn metadata(&self) -> Result<ProviderMetadata> {
        if let Some(metadata) = self.metadata.read().await.as_ref() {
            return Ok(metadata.clone());
        }
        let metadata = self.discover().await?;
        *self.metadata.write().await = Some(metadata.clone());
        Ok(metadata)
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse> {
        let metadata = self.metadata().await?;
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ];

        let mut request = self.http.post(&metadata.token_endpoint);
        match &self.client_secret {
            Some(secret) => {
                request = request.basic_auth(&self.client_id, Some(secret.expose_secret()));
            }
            None => form.push(("client_id", self.client_id.as_str())),
        }

        let response = match request.form(&form).send().await {
            Ok(response) => response,
            Err(e) => {
                // The endpoint may have moved; discover it again on the next login
                warn!(error = %e, "Token endpoint unreachable, dropping cached provider metadata");
                self.invalidate().await;
                return Err(e.into());
            }
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "token endpoint answered with status {status}: {body}"
            )));
        }
        Ok(response.json().await?)
    }

    async fn signing_key(&self, kid: Option<String>) -> Result<Jwk> {
        let cached = self.jwks.read().await.clone();
        if let Some(key) = cached.as_ref().and_then(|set| select_key(set, kid.as_deref())) {
            return Ok(key);
        }

        let jwks = self.fetch_jwks().await?;
        select_key(&jwks, kid.as_deref()).ok_or_else(|| {
            Error::unauthorized(format!(
                "no signing key {} published by the provider",
                kid.as_deref().unwrap_or("<none>")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JWKS: &str = r#"{
        "keys": [
            { "kty": "oct", "kid": "one", "alg": "HS256", "k": "c2VjcmV0LW9uZQ" },
            { "kty": "oct", "kid": "two", "alg": "HS256", "k": "c2VjcmV0LXR3bw" }
        ]
    }"#;

    #[test]
    fn test_select_key_by_kid() {
        let jwks: JwkSet = serde_json::from_str(JWKS).unwrap();
        let key = select_key(&jwks, Some("two")).unwrap();
        assert_eq!(key.common.key_id.as_deref(), Some("two"));
        assert!(select_key(&jwks, Some("three")).is_none());
        assert!(select_key(&jwks, None).is_none());
    }

    #[test]
    fn test_select_only_key_without_kid() {
        let jwks: JwkSet = serde_json::from_str(
            r#"{ "keys": [ { "kty": "oct", "alg": "HS256", "k": "c2VjcmV0LW9uZQ" } ] }"#,
        )
        .unwrap();
        assert!(select_key(&jwks, None).is_some());
    }

    #[test]
    fn test_token_response_without_access_token() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"id_token":"a.b.c","token_type":"Bearer"}"#).unwrap();
        assert_eq!(token.id_token, "a.b.c");
        assert_eq!(token.access_token, None);
    }

    #[tokio::test]
    async fn test_overrides_skip_discovery() {
        let config = OpenIdConfig {
            issuer_uri: "https://idp.invalid/".into(),
            client_id: "meshview".into(),
            authorization_endpoint: Some("https://idp.invalid/auth".into()),
            token_endpoint: Some("https://idp.invalid/token".into()),
            jwks_uri: Some("https://idp.invalid/keys".into()),
            ..Default::default()
        };
        let provider = HttpOpenIdProvider::new(&config).unwrap();
        let metadata = provider.metadata().await.unwrap();
        assert_eq!(metadata.issuer, "https://idp.invalid");
        assert_eq!(metadata.authorization_endpoint, "https://idp.invalid/auth");
        assert_eq!(metadata.jwks_uri, "https://idp.invalid/keys");
        assert!(provider.metadata.read().await.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_token_endpoint_drops_cached_metadata() {
        let config = OpenIdConfig {
            issuer_uri: "http://127.0.0.1:1".into(),
            client_id: "meshview".into(),
            authorization_endpoint: Some("http://127.0.0.1:1/auth".into()),
            token_endpoint: Some("http://127.0.0.1:1/token".into()),
            jwks_uri: Some("http://127.0.0.1:1/keys".into()),
            ..Default::default()
        };
        let provider = HttpOpenIdProvider::new(&config).unwrap();
        provider.metadata().await.unwrap();
        *provider.jwks.write().await = Some(serde_json::from_str(JWKS).unwrap());

        let err = provider
            .exchange_code("code", "verifier", "https://console.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert!(provider.metadata.read().await.is_none());
        assert!(provider.jwks.read().await.is_none());
    }

    #[test]
    fn test_invalid_proxy_is_a_config_error() {
        let config = OpenIdConfig {
            https_proxy: Some("not a url".into()),
            ..Default::default()
        };
        assert!(matches!(
            HttpOpenIdProvider::new(&config),
            Err(Error::Config(_))
        ));
    }
}
