//! HTTP surface of the authentication layer
//!
//! # Endpoints (below the web root)
//!
//! - `POST /api/authenticate` - log in with form credentials
//! - `GET /api/auth/info` - strategy and current session, never 401
//! - `GET /api/logout` - drop every session
//! - `GET /api/auth/openid_redirect` - start an OpenID login
//! - `GET /api/auth/openshift_redirect/{cluster}` - start an OAuth login
//! - `GET /api/auth/callback/{cluster}` - OAuth callback
//! - `GET /api/auth/session` - identities of the caller (session required)
//! - `GET /healthz` - health check
//!
//! The web root itself checks for an OpenID callback before serving the
//! console index.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use meshview_common::{AuthStrategy, ServerConfig, AUDIT_USER_HEADER};

use crate::controller::{AuthController, UserSessions};
use crate::error::{Error, Result};
use crate::request::AuthRequest;

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// The configured strategy
    pub controller: Arc<AuthController>,
    /// Listener and public URL settings
    pub server: Arc<ServerConfig>,
    /// Name of the home cluster
    pub home_cluster: String,
}

impl AppState {
    fn auth_request(&self, headers: HeaderMap, uri: Uri) -> AuthRequest {
        AuthRequest::new(&self.server, headers, uri)
    }
}

/// Body of `GET /api/auth/info`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfoResponse {
    /// Configured strategy
    pub strategy: AuthStrategy,
    /// Where the login page sends the browser, for redirect based strategies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    /// Current session, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_info: Option<SessionInfo>,
}

/// Summary of the caller's session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Username on the home cluster
    pub username: String,
    /// When the session ends
    pub expires_on: DateTime<Utc>,
}

fn found(location: String) -> Response {
    match HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        Err(e) => Error::Internal(format!("unencodable redirect location: {e}")).into_response(),
    }
}

/// Build the router for `state`
pub fn router(state: AppState) -> Router {
    let server = state.server.clone();
    let index = get(index_handler).layer(from_fn_with_state(state.clone(), openid_callback));

    let mut app = Router::new()
        .route(&server.path("/api/authenticate"), post(authenticate_handler))
        .route(&server.path("/api/auth/info"), get(info_handler))
        .route(&server.path("/api/logout"), get(logout_handler))
        .route(
            &server.path("/api/auth/openid_redirect"),
            get(openid_redirect_handler),
        )
        .route(
            &server.path("/api/auth/openshift_redirect/{cluster}"),
            get(openshift_redirect_handler),
        )
        .route(
            &server.path("/api/auth/callback/{cluster}"),
            get(openshift_callback_handler),
        )
        .route(
            &server.path("/api/auth/session"),
            get(session_handler).layer(from_fn_with_state(state.clone(), require_session)),
        )
        .route(&server.path("/healthz"), get(|| async { "ok" }))
        .route(&server.web_root_with_slash(), index.clone());

    if server.web_root != "/" {
        app = app.route(&server.web_root, index);
    }

    app.with_state(state)
}

/// Validate the caller's sessions before running the inner handler
///
/// The identities are stored in the request extensions and the home cluster
/// username is forwarded in the audit header.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let req = state.auth_request(request.headers().clone(), request.uri().clone());
    let mut jar = req.jar();

    let sessions = match state.controller.validate_session(&req, &mut jar).await {
        Ok(sessions) => sessions,
        Err(e) => return (jar, e).into_response(),
    };

    let audit_user = sessions
        .get(&state.home_cluster)
        .or_else(|| sessions.values().next())
        .map(|s| s.username.clone());
    if let Some(value) = audit_user.and_then(|u| HeaderValue::from_str(&u).ok()) {
        request
            .headers_mut()
            .insert(HeaderName::from_static(AUDIT_USER_HEADER), value);
    }
    request.extensions_mut().insert(sessions);

    let response = next.run(request).await;
    (jar, response).into_response()
}

/// Finish an OpenID login landing on the web root, else pass through
async fn openid_callback(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let AuthController::OpenId(controller) = state.controller.as_ref() {
        let req = state.auth_request(request.headers().clone(), request.uri().clone());
        let mut jar = req.jar();
        if let Some(location) = controller.handle_callback(&req, &mut jar).await {
            return (jar, found(location)).into_response();
        }
    }
    next.run(request).await
}

async fn index_handler() -> Html<&'static str> {
    Html("<!doctype html><html><head><title>meshview</title></head><body><div id=\"root\"></div></body></html>")
}

async fn authenticate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let form: HashMap<String, String> = url::form_urlencoded::parse(&body).into_owned().collect();
    let req = state.auth_request(headers, uri).with_form(form);
    let mut jar = req.jar();

    match state.controller.authenticate(&req, &mut jar).await {
        Ok(session) => (jar, Json(session)).into_response(),
        Err(e) => (jar, e).into_response(),
    }
}

async fn info_handler(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let req = state.auth_request(headers, uri);
    let mut jar = req.jar();

    let authorization_endpoint = match state.controller.as_ref() {
        AuthController::OpenId(_) => Some(state.server.path("/api/auth/openid_redirect")),
        AuthController::OpenShift(_) => Some(state.server.path(&format!(
            "/api/auth/openshift_redirect/{}",
            state.home_cluster
        ))),
        _ => None,
    };

    let session_info = match state.controller.validate_session(&req, &mut jar).await {
        Ok(sessions) => sessions
            .get(&state.home_cluster)
            .or_else(|| sessions.values().next())
            .map(|s| SessionInfo {
                username: s.username.clone(),
                expires_on: s.expires_on,
            }),
        Err(e) => {
            debug!(reason = %e, "Auth info without a session");
            None
        }
    };

    let body = AuthInfoResponse {
        strategy: state.controller.strategy(),
        authorization_endpoint,
        session_info,
    };
    (jar, Json(body)).into_response()
}

async fn logout_handler(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let req = state.auth_request(headers, uri);
    let mut jar = req.jar();
    match state.controller.terminate_session(&req, &mut jar).await {
        Ok(()) => (jar, StatusCode::NO_CONTENT).into_response(),
        Err(e) => (jar, e).into_response(),
    }
}

async fn openid_redirect_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let AuthController::OpenId(controller) = state.controller.as_ref() else {
        return Error::BadRequest("the openid strategy is not configured".into()).into_response();
    };
    let req = state.auth_request(headers, uri);
    let mut jar = req.jar();
    match controller.redirect(&req, &mut jar).await {
        Ok(location) => (jar, found(location)).into_response(),
        Err(e) => (jar, e).into_response(),
    }
}

async fn openshift_redirect_handler(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let AuthController::OpenShift(controller) = state.controller.as_ref() else {
        return Error::BadRequest("the openshift strategy is not configured".into())
            .into_response();
    };
    let req = state.auth_request(headers, uri).with_cluster(cluster);
    let mut jar = req.jar();
    match controller.redirect(&req, &mut jar).await {
        Ok(location) => (jar, found(location)).into_response(),
        Err(e) => (jar, e).into_response(),
    }
}

async fn openshift_callback_handler(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let AuthController::OpenShift(controller) = state.controller.as_ref() else {
        return Error::BadRequest("the openshift strategy is not configured".into())
            .into_response();
    };
    let req = state.auth_request(headers, uri).with_cluster(cluster);
    let mut jar = req.jar();
    let location = controller.handle_callback(&req, &mut jar).await;
    (jar, found(location)).into_response()
}

async fn session_handler(Extension(sessions): Extension<UserSessions>) -> Json<UserSessions> {
    Json(sessions)
}

/// Serve the router until the process ends
pub async fn start_server(
    config: ServerConfig,
    controller: AuthController,
    home_cluster: String,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.address, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address: {}", e)))?;

    let tls = config.tls.clone();
    let state = AppState {
        controller: Arc::new(controller),
        server: Arc::new(config),
        home_cluster,
    };
    let strategy = state.controller.strategy();
    let app = router(state);

    match tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
                .await
                .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;
            info!(addr = %addr, strategy = %strategy, "Starting HTTPS server");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(addr = %addr, strategy = %strategy, "Starting HTTP server");
            axum_server::bind(addr).serve(app.into_make_service()).await
        }
    }
    .map_err(|e| Error::Internal(format!("Server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::controller::tests::test_store;
    use crate::controller::TokenController;
    use axum::body::{to_bytes, Body};
    use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
    use axum::http::Request as HttpRequest;
    use meshview_common::ClustersConfig;
    use tower::ServiceExt;

    fn app(web_root: &str) -> Router {
        let mut api = MockClusterApi::new();
        api.expect_list_namespaces()
            .returning(|_, _| Ok(vec!["default".to_string()]));
        let controller = TokenController::new(
            Arc::new(api),
            test_store(false, AuthStrategy::Token),
            ClustersConfig::default(),
            3600,
        );
        router(AppState {
            controller: Arc::new(AuthController::Token(controller)),
            server: Arc::new(ServerConfig {
                web_root: web_root.to_string(),
                ..Default::default()
            }),
            home_cluster: "home".into(),
        })
    }

    fn login(uri: &str, form: &'static str) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap()
    }

    /// `Cookie` header value replaying the non-empty cookies a response set
    fn replay(response: &Response) -> String {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .filter(|pair| pair.split_once('=').is_some_and(|(_, value)| !value.is_empty()))
            .collect::<Vec<_>>()
            .join("; ")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = app("/")
            .oneshot(HttpRequest::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_then_session() {
        let app = app("/console");
        let response = app
            .clone()
            .oneshot(login("/console/api/authenticate", "token=abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookies = replay(&response);
        assert!(cookies.starts_with("session="));
        let body = json_body(response).await;
        assert_eq!(body["username"], "token");
        assert!(body["expiresOn"].is_string());

        let response = app
            .oneshot(
                HttpRequest::get("/console/api/auth/session")
                    .header(COOKIE, cookies)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["home"]["username"], "token");
    }

    #[tokio::test]
    async fn test_empty_token_is_bad_request() {
        let response = app("/")
            .oneshot(login("/api/authenticate", "token="))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_session_requires_cookies() {
        let response = app("/")
            .oneshot(HttpRequest::get("/api/auth/session").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_info_without_session() {
        let response = app("/")
            .oneshot(HttpRequest::get("/api/auth/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["strategy"], "token");
        assert!(body.get("sessionInfo").is_none());
        assert!(body.get("authorizationEndpoint").is_none());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let app = app("/");
        let response = app
            .clone()
            .oneshot(login("/api/authenticate", "token=abc"))
            .await
            .unwrap();
        let cookies = replay(&response);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/api/logout")
                    .header(COOKIE, cookies)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cleared: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
        assert!(!cleared.is_empty());
        assert!(cleared
            .iter()
            .all(|v| v.to_str().unwrap().starts_with("session=;")));

        let response = app
            .oneshot(HttpRequest::get("/api/logout").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_redirect_routes_need_their_strategy() {
        let response = app("/")
            .oneshot(
                HttpRequest::get("/api/auth/openid_redirect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_index_served_under_web_root() {
        let app = app("/console");
        for path in ["/console", "/console/"] {
            let response = app
                .clone()
                .oneshot(HttpRequest::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }
    }
}
