//! Kubeconfig loading with per-cluster endpoint policy applied

use std::time::Duration;

use http::Uri;
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::error::ConfigError;
use crate::identity::ClusterIdentity;
use crate::net::force_http;

/// Default connection timeout for API server clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for API server clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts applied to every cluster's client configuration
#[derive(Debug, Clone, Copy)]
pub struct KubeTimeouts {
    /// TCP/TLS connect bound
    pub connect: Duration,
    /// Per-read bound; long-lived watches are not used by corridor
    pub read: Duration,
}

impl Default for KubeTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Build a `kube::Config` from a cluster's kubeconfig and policy.
///
/// The policy's API URL override replaces the kubeconfig server, and
/// `api_proxy_force_http` downgrades the scheme to plain http.
pub async fn client_config(
    identity: &ClusterIdentity,
    timeouts: KubeTimeouts,
) -> Result<kube::Config, ConfigError> {
    let raw = identity.kubeconfig.trim();
    if raw.is_empty() {
        return Err(ConfigError::missing(&identity.id, "kubeconfig is empty"));
    }

    let kubeconfig = Kubeconfig::from_yaml(raw)
        .map_err(|e| ConfigError::kubeconfig(&identity.id, e.to_string()))?;

    let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ConfigError::kubeconfig(&identity.id, e.to_string()))?;

    if let Some(endpoint) = identity.policy.api_proxy_url() {
        config.cluster_url = parse_endpoint(endpoint)
            .map_err(|msg| ConfigError::endpoint(&identity.id, endpoint, msg))?;
    }

    if identity.policy.api_proxy_force_http {
        let current = config.cluster_url.to_string();
        config.cluster_url = force_http(&config.cluster_url)
            .map_err(|e| ConfigError::endpoint(&identity.id, current, e.to_string()))?;
    }

    config.default_namespace = identity.policy.namespace().to_string();
    config.connect_timeout = Some(timeouts.connect);
    config.read_timeout = Some(timeouts.read);

    Ok(config)
}

/// Parse an endpoint override, assuming https when no scheme is given.
///
/// # Examples
///
/// ```
/// use corridor_common::kubeconfig::parse_endpoint;
///
/// assert_eq!(parse_endpoint("10.0.0.1:6443").unwrap().to_string(), "https://10.0.0.1:6443/");
/// assert_eq!(parse_endpoint("http://127.0.0.1:8001").unwrap().scheme_str(), Some("http"));
/// ```
pub fn parse_endpoint(endpoint: &str) -> Result<Uri, String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    };
    let uri: Uri = with_scheme.parse().map_err(|e| format!("{}", e))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        other => return Err(format!("unsupported scheme {:?}", other)),
    }
    if uri.host().is_none() {
        return Err("missing host".to_string());
    }
    Ok(uri)
}
