//! meshview - authentication and session gateway for the cluster console

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshview_auth::controller::openshift::OpenShiftSettings;
use meshview_auth::controller::{HeaderController, OpenShiftController, TokenController};
use meshview_auth::{
    AuthController, ClusterApi, CookieNames, CookieSessionStore, HttpOpenIdProvider,
    KubeClusterApi, OpenIdController, OpenIdSettings, OpenShiftOAuthService, SessionCodec,
};
use meshview_common::{AuthStrategy, Clock, Config, SystemClock};

/// meshview - log users into one or more clusters and keep them logged in
#[derive(Parser, Debug)]
#[command(name = "meshview", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", env = "MESHVIEW_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // TLS towards clusters and identity providers goes through aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    let kube_configs = load_kube_configs(&config).await?;
    let clusters = Arc::new(
        KubeClusterApi::new(kube_configs)
            .map_err(|e| anyhow::anyhow!("Failed to create cluster clients: {}", e))?,
    );

    let controller = build_controller(&config, clusters)?;
    meshview_auth::start_server(
        config.server.clone(),
        controller,
        config.clusters.home.clone(),
    )
    .await?;
    Ok(())
}

/// Base kube configuration of every configured cluster
///
/// The home cluster uses the inferred configuration (in-cluster or local
/// kubeconfig); remote clusters are read from their kubeconfig files.
async fn load_kube_configs(config: &Config) -> anyhow::Result<HashMap<String, kube::Config>> {
    let mut configs = HashMap::new();

    let home = kube::Config::infer()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to infer kube config for home cluster: {}", e))?;
    configs.insert(config.clusters.home.clone(), home);

    for remote in &config.clusters.remote {
        let kubeconfig = Kubeconfig::read_from(&remote.kubeconfig).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read kubeconfig {:?} for cluster {}: {}",
                remote.kubeconfig,
                remote.name,
                e
            )
        })?;
        let cluster_config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    anyhow::anyhow!("Invalid kubeconfig for cluster {}: {}", remote.name, e)
                })?;
        info!(cluster = %remote.name, server = %cluster_config.cluster_url, "Loaded remote cluster");
        configs.insert(remote.name.clone(), cluster_config);
    }

    Ok(configs)
}

/// Controller for the configured strategy
fn build_controller(
    config: &Config,
    clusters: Arc<KubeClusterApi>,
) -> anyhow::Result<AuthController> {
    let signing_key = config.login_token.signing_key.as_str();
    let codec = Arc::new(SessionCodec::new(signing_key.as_bytes())?);
    let names = CookieNames::new(config.clusters.is_multi_cluster());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let strategy = config.auth.strategy;
    let expiration = config.login_token.expiration_seconds;

    let sessions: CookieSessionStore<()> = CookieSessionStore::new(codec, names, strategy, clock);
    let api: Arc<dyn ClusterApi> = clusters.clone();

    let controller = match strategy {
        AuthStrategy::Token => AuthController::Token(TokenController::new(
            api,
            sessions.with_strategy(strategy),
            config.clusters.clone(),
            expiration,
        )),
        AuthStrategy::Header => AuthController::Header(HeaderController::new(
            api,
            sessions.with_strategy(strategy),
            config.clusters.home.clone(),
            expiration,
        )),
        AuthStrategy::Openshift => {
            let openshift = &config.auth.openshift;
            let oauth = OpenShiftOAuthService::new(clusters.service_clients(), openshift)?;
            AuthController::OpenShift(OpenShiftController::new(
                api,
                Arc::new(oauth),
                sessions.with_strategy(strategy),
                config.clusters.clone(),
                OpenShiftSettings {
                    client_id: openshift.client_id(),
                    nonce_lifetime: chrono::Duration::seconds(openshift.token_age_seconds as i64),
                    expiration: chrono::Duration::seconds(expiration),
                    web_root: config.server.web_root.clone(),
                },
            ))
        }
        AuthStrategy::Openid => {
            let openid = &config.auth.openid;
            let provider = HttpOpenIdProvider::new(openid)?;
            AuthController::OpenId(OpenIdController::new(
                api,
                Arc::new(provider),
                sessions.with_strategy(strategy),
                config.clusters.clone(),
                OpenIdSettings::from_config(openid, signing_key, &config.server.web_root),
            ))
        }
        AuthStrategy::Ldap => {
            anyhow::bail!(
                "the ldap strategy needs a directory client; embed meshview-auth and supply an LdapAuthenticator"
            )
        }
    };

    info!(strategy = %strategy, clusters = config.clusters.names().len(), "Authentication ready");
    Ok(controller)
}
