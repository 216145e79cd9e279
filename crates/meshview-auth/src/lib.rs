//! Authentication and sessions for the meshview console
//!
//! Turns external credentials (bearer tokens, proxy headers, an OAuth server,
//! an OpenID provider or an LDAP directory) into logged in users, one per
//! cluster, and keeps them logged in across requests without server side
//! storage.
//!
//! # Architecture
//!
//! ```text
//! browser ──► server (axum) ──► AuthController ──► ClusterApi (kube)
//!                │                    │
//!                └── SessionJar ◄── CookieSessionStore (AES-GCM, chunked)
//! ```
//!
//! Sessions live entirely in encrypted cookies. Each strategy controller
//! authenticates fresh credentials, re-validates sessions on later requests
//! and terminates them on logout.

#![deny(missing_docs)]

pub mod cluster;
pub mod controller;
pub mod error;
pub mod jwt;
pub mod oauth;
pub mod openid;
pub mod pkce;
pub mod request;
pub mod server;
pub mod session;

pub use cluster::{AuthInfo, ClusterApi, ClusterError, KubeClusterApi};
pub use controller::{AuthController, UserSessionData, UserSessions};
pub use error::{Error, Result};
pub use oauth::{OAuthService, OpenShiftOAuthService};
pub use openid::{HttpOpenIdProvider, OpenIdController, OpenIdProvider, OpenIdSettings};
pub use request::AuthRequest;
pub use server::{router, start_server, AppState};
pub use session::{CookieNames, CookieSessionStore, SessionCodec, SessionData, SessionJar};
