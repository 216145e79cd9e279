//! Console configuration
//!
//! Configuration is read once at startup from a YAML document. Every field has
//! a default so a minimal file only needs the session signing key:
//!
//! ```yaml
//! auth:
//!   strategy: openid
//!   openid:
//!     issuer_uri: https://idp.example.com
//!     client_id: meshview
//! login_token:
//!   signing_key: 0123456789abcdef
//! ```
//!
//! The strategy is fixed for the lifetime of the process; changing it requires
//! a restart and invalidates every session created under the old strategy.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::DEFAULT_SERVER_PORT;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid YAML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A field holds a value that cannot be used
    #[error("invalid config field {field}: {message}")]
    Invalid {
        /// Dotted path of the offending field
        field: &'static str,
        /// What is wrong with it
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Authentication method used by the console
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStrategy {
    /// Bearer token submitted through the login form
    Token,
    /// Credentials forwarded by a fronting proxy on every request
    Header,
    /// Cluster-native OAuth2 server (OpenShift)
    Openshift,
    /// OpenID Connect authorization code flow
    Openid,
    /// Directory credentials exchanged for a bearer token
    Ldap,
}

impl AuthStrategy {
    /// Name stored inside sessions and reported to the UI
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStrategy::Token => "token",
            AuthStrategy::Header => "header",
            AuthStrategy::Openshift => "openshift",
            AuthStrategy::Openid => "openid",
            AuthStrategy::Ldap => "ldap",
        }
    }
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which token issued by the OpenID provider is used against the cluster API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiToken {
    /// The `id_token` (a JWT)
    #[default]
    IdToken,
    /// The opaque `access_token`
    AccessToken,
}

/// Top level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Authentication settings
    pub auth: AuthConfig,
    /// Session lifetime and encryption key
    pub login_token: LoginTokenConfig,
    /// Listener and public URL settings
    pub server: ServerConfig,
    /// Clusters the console can log into
    pub clusters: ClustersConfig,
}

/// Authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Strategy selected at startup
    pub strategy: AuthStrategy,
    /// OpenID Connect provider settings
    pub openid: OpenIdConfig,
    /// Cluster OAuth server settings
    pub openshift: OpenShiftConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            strategy: AuthStrategy::Token,
            openid: OpenIdConfig::default(),
            openshift: OpenShiftConfig::default(),
        }
    }
}

/// OpenID Connect provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenIdConfig {
    /// Issuer URI; discovery is read from `<issuer>/.well-known/openid-configuration`
    pub issuer_uri: String,
    /// Client identifier registered at the provider
    pub client_id: String,
    /// Client secret; when set the token exchange uses HTTP basic auth
    pub client_secret: String,
    /// Requested scopes (`openid` is always added)
    pub scopes: Vec<String>,
    /// Claim holding the display name of the user
    pub username_claim: String,
    /// Seconds the browser has to complete the round trip to the provider
    pub authentication_timeout: u64,
    /// Authorization endpoint override
    pub authorization_endpoint: Option<String>,
    /// Token endpoint override
    pub token_endpoint: Option<String>,
    /// JWKS endpoint override
    pub jwks_uri: Option<String>,
    /// Extra query parameters appended to the authorization URL
    pub additional_request_params: BTreeMap<String, String>,
    /// E-mail or hosted domains allowed to log in; empty allows all
    pub allowed_domains: Vec<String>,
    /// Token presented to the cluster API
    pub api_token: ApiToken,
    /// Skip cluster privilege checks and validate the id_token locally
    pub disable_rbac: bool,
    /// Accept any TLS certificate from the provider
    pub insecure_skip_verify_tls: bool,
    /// Proxy for plain HTTP provider URLs
    pub http_proxy: Option<String>,
    /// Proxy for HTTPS provider URLs
    pub https_proxy: Option<String>,
}

impl Default for OpenIdConfig {
    fn default() -> Self {
        Self {
            issuer_uri: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: vec!["openid".to_string()],
            username_claim: "sub".to_string(),
            authentication_timeout: 300,
            authorization_endpoint: None,
            token_endpoint: None,
            jwks_uri: None,
            additional_request_params: BTreeMap::new(),
            allowed_domains: Vec::new(),
            api_token: ApiToken::IdToken,
            disable_rbac: false,
            insecure_skip_verify_tls: false,
            http_proxy: None,
            https_proxy: None,
        }
    }
}

impl OpenIdConfig {
    /// Configured scopes with `openid` guaranteed to be present
    pub fn effective_scopes(&self) -> Vec<String> {
        let mut scopes = self.scopes.clone();
        if !scopes.iter().any(|s| s == "openid") {
            scopes.push("openid".to_string());
        }
        scopes
    }
}

/// Cluster OAuth server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenShiftConfig {
    /// Prefix of the OAuthClient name registered in each cluster
    pub client_id_prefix: String,
    /// Namespace the console is installed in
    pub namespace: String,
    /// Lifetime of the nonce cookie in seconds
    pub token_age_seconds: u64,
    /// Accept any TLS certificate from the OAuth server
    pub insecure_skip_verify_tls: bool,
}

impl Default for OpenShiftConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "meshview".to_string(),
            namespace: "meshview".to_string(),
            token_age_seconds: 300,
            insecure_skip_verify_tls: false,
        }
    }
}

impl OpenShiftConfig {
    /// Name of the OAuthClient object the console authenticates as
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, self.namespace)
    }
}

/// Session lifetime and encryption key
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginTokenConfig {
    /// AES key for cookie encryption; 16, 24 or 32 bytes
    pub signing_key: String,
    /// Session lifetime for strategies without an upstream expiry
    pub expiration_seconds: i64,
}

impl Default for LoginTokenConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            expiration_seconds: 86_400,
        }
    }
}

impl fmt::Debug for LoginTokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginTokenConfig")
            .field("signing_key", &"<redacted>")
            .field("expiration_seconds", &self.expiration_seconds)
            .finish()
    }
}

/// TLS material for the listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
}

/// Listener and public URL settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub address: String,
    /// Bind port
    pub port: u16,
    /// Path prefix the console is served under
    pub web_root: String,
    /// Public host name, when it cannot be inferred from the request
    pub web_fqdn: Option<String>,
    /// Public schema (`http` or `https`), when it cannot be inferred
    pub web_schema: Option<String>,
    /// Public port, when it differs from the bind port
    pub web_port: Option<String>,
    /// Serve HTTPS with this certificate
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            web_root: "/".to_string(),
            web_fqdn: None,
            web_schema: None,
            web_port: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Whether the listener itself terminates TLS
    pub fn is_https(&self) -> bool {
        self.tls.is_some()
    }

    /// Web root followed by exactly one slash
    pub fn web_root_with_slash(&self) -> String {
        if self.web_root.ends_with('/') {
            self.web_root.clone()
        } else {
            format!("{}/", self.web_root)
        }
    }

    /// Join an absolute path below the web root
    pub fn path(&self, suffix: &str) -> String {
        format!("{}{}", self.web_root.trim_end_matches('/'), suffix)
    }
}

/// A cluster other than the one the console runs in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCluster {
    /// Cluster name used in cookies and URLs
    pub name: String,
    /// Kubeconfig giving the console access to the cluster
    pub kubeconfig: PathBuf,
}

/// Clusters the console can log into
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClustersConfig {
    /// Name of the cluster the console runs in
    pub home: String,
    /// Additional clusters
    pub remote: Vec<RemoteCluster>,
}

impl Default for ClustersConfig {
    fn default() -> Self {
        Self {
            home: "home".to_string(),
            remote: Vec::new(),
        }
    }
}

impl ClustersConfig {
    /// Whether more than one cluster is configured
    pub fn is_multi_cluster(&self) -> bool {
        !self.remote.is_empty()
    }

    /// All cluster names, home first
    pub fn names(&self) -> Vec<String> {
        std::iter::once(self.home.clone())
            .chain(self.remote.iter().map(|r| r.name.clone()))
            .collect()
    }

    /// Whether `name` is a configured cluster
    pub fn contains(&self, name: &str) -> bool {
        self.home == name || self.remote.iter().any(|r| r.name == name)
    }
}

impl Config {
    /// Read and validate a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&raw)?;
        info!(
            path = %path.display(),
            strategy = %config.auth.strategy,
            clusters = config.clusters.remote.len() + 1,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate a YAML configuration document
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_signing_key(&self.login_token.signing_key)?;
        validate_web_root(&self.server.web_root)?;

        if self.login_token.expiration_seconds <= 0 {
            return Err(ConfigError::invalid(
                "login_token.expiration_seconds",
                "must be positive",
            ));
        }

        if self.auth.strategy == AuthStrategy::Openid {
            let openid = &self.auth.openid;
            if openid.issuer_uri.is_empty() {
                return Err(ConfigError::invalid(
                    "auth.openid.issuer_uri",
                    "required by the openid strategy",
                ));
            }
            if openid.client_id.is_empty() {
                return Err(ConfigError::invalid(
                    "auth.openid.client_id",
                    "required by the openid strategy",
                ));
            }
            if openid.disable_rbac {
                warn!("OpenID RBAC is disabled; every user shares the console's own cluster privileges");
            }
        }

        let mut seen = vec![self.clusters.home.as_str()];
        for remote in &self.clusters.remote {
            if seen.contains(&remote.name.as_str()) {
                return Err(ConfigError::invalid(
                    "clusters.remote",
                    format!("cluster name {} is used more than once", remote.name),
                ));
            }
            seen.push(&remote.name);
        }

        Ok(())
    }
}

fn validate_signing_key(key: &str) -> Result<(), ConfigError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        n => Err(ConfigError::invalid(
            "login_token.signing_key",
            format!("signing key for sessions must be 16, 24 or 32 bytes long, got {n}"),
        )),
    }
}

fn validate_web_root(web_root: &str) -> Result<(), ConfigError> {
    let valid_chars = web_root
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/-._~".contains(c));
    if !web_root.starts_with('/') || !valid_chars {
        return Err(ConfigError::invalid(
            "server.web_root",
            format!("must begin with a / and contain valid URL path characters: {web_root}"),
        ));
    }
    if web_root != "/" && web_root.ends_with('/') {
        return Err(ConfigError::invalid(
            "server.web_root",
            format!("must not contain a trailing /: {web_root}"),
        ));
    }
    if web_root.contains("/../") {
        return Err(ConfigError::invalid(
            "server.web_root",
            format!("must not contain '/../': {web_root}"),
        ));
    }
    Ok(())
}
