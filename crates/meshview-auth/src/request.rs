//! Request context handed to strategy controllers
//!
//! Controllers see an [`AuthRequest`] rather than raw axum extractors so the
//! same controller code serves the JSON endpoints, the redirect endpoints and
//! the callback middleware.

use std::collections::HashMap;

use axum::http::header::{AUTHORIZATION, HOST};
use axum::http::{HeaderMap, Uri};

use meshview_common::ServerConfig;

use crate::session::SessionJar;

const FORWARDED_PROTO: &str = "x-forwarded-proto";
const FORWARDED_HOST: &str = "x-forwarded-host";
const FORWARDED_PORT: &str = "x-forwarded-port";

/// An inbound request as seen by the authentication layer
#[derive(Debug, Clone)]
pub struct AuthRequest {
    headers: HeaderMap,
    uri: Uri,
    form: HashMap<String, String>,
    cluster: Option<String>,
    public_url: String,
    cookie_path: String,
    secure: bool,
}

impl AuthRequest {
    /// Capture the parts of a request needed for authentication
    pub fn new(server: &ServerConfig, headers: HeaderMap, uri: Uri) -> Self {
        let public_url = guess_public_url(server, &headers, &uri);
        let secure = server.is_https() || public_url.starts_with("https://");
        Self {
            headers,
            uri,
            form: HashMap::new(),
            cluster: None,
            public_url,
            cookie_path: server.web_root.clone(),
            secure,
        }
    }

    /// Attach submitted form fields
    pub fn with_form(mut self, form: HashMap<String, String>) -> Self {
        self.form = form;
        self
    }

    /// Attach the cluster named in the request path
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Cookie jar for this request
    pub fn jar(&self) -> SessionJar {
        SessionJar::from_headers(&self.headers, self.cookie_path.clone(), self.secure)
    }

    /// Request headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if it is valid text
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values of a header
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    /// Token from `Authorization: Bearer <token>`
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.headers.get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        let token = token.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
    }

    /// Decoded query parameter
    pub fn query(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Submitted form field
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// Cluster from the path, if any
    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    /// Public URL of the console, including the web root
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// Whether cookies must carry `Secure`
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Path of the request, without query
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// Guess the URL the browser used to reach the console
///
/// Configured values win over forwarding headers, which win over what the
/// request itself carries.
pub fn guess_public_url(server: &ServerConfig, headers: &HeaderMap, uri: &Uri) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let schema = server
        .web_schema
        .clone()
        .or_else(|| header(FORWARDED_PROTO))
        .or_else(|| uri.scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string());

    let raw_host = server
        .web_fqdn
        .clone()
        .or_else(|| header(FORWARDED_HOST))
        .or_else(|| header(HOST.as_str()))
        .or_else(|| uri.host().map(str::to_string))
        .unwrap_or_default();
    let (host, host_port) = split_host_port(&raw_host);

    let port = server
        .web_port
        .clone()
        .or_else(|| header(FORWARDED_PORT))
        .or(host_port)
        .or_else(|| uri.port_u16().map(|p| p.to_string()))
        .unwrap_or_else(|| server.port.to_string());

    let default_port = match schema.as_str() {
        "https" => "443",
        _ => "80",
    };
    let mut url = if port == default_port {
        format!("{schema}://{host}")
    } else {
        format!("{schema}://{host}:{port}")
    };

    if server.web_root != "/" {
        url.push_str(server.web_root.trim_end_matches('/'));
    }
    url
}

fn split_host_port(raw: &str) -> (String, Option<String>) {
    // IPv6 literals keep their brackets
    if let Some(end) = raw.rfind(']') {
        let (host, rest) = raw.split_at(end + 1);
        let port = rest.strip_prefix(':').map(str::to_string);
        return (host.to_string(), port);
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), Some(port.to_string()))
        }
        _ => (raw.to_string(), None),
    }
}
