//! Common types for meshview: configuration, clock, and shared constants

#![deny(missing_docs)]

pub mod clock;
pub mod config;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    ApiToken, AuthConfig, AuthStrategy, ClustersConfig, Config, ConfigError, LoginTokenConfig,
    OpenIdConfig, OpenShiftConfig, RemoteCluster, ServerConfig, TlsConfig,
};

/// Default port for the console HTTP server
pub const DEFAULT_SERVER_PORT: u16 = 20001;

/// Internal request header carrying the resolved username for audit logging
pub const AUDIT_USER_HEADER: &str = "meshview-user";

/// Prefix Kubernetes puts in front of ServiceAccount usernames
pub const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// Strip the ServiceAccount prefix from a Kubernetes username
///
/// `system:serviceaccount:k8s_user` becomes `k8s_user`; other names are
/// returned unchanged.
pub fn strip_service_account_prefix(username: &str) -> &str {
    username
        .strip_prefix(SERVICE_ACCOUNT_PREFIX)
        .unwrap_or(username)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_service_account_prefix() {
        assert_eq!(
            strip_service_account_prefix("system:serviceaccount:k8s_user"),
            "k8s_user"
        );
        assert_eq!(
            strip_service_account_prefix("system:serviceaccount:ns:sa"),
            "ns:sa"
        );
        assert_eq!(strip_service_account_prefix("alice"), "alice");
    }
}
