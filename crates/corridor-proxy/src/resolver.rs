//! Workload identifier → upstream address
//!
//! Resolution order, first success wins:
//! 1. `status.proxyTarget` on the workspace resource (`scheme://host:port`)
//! 2. A Service named after the identifier, else labeled with it
//! 3. A configured per-workload override (`host[:port]`)
//! 4. The cluster DNS name `<sanitized>.<namespace>.svc.cluster.local`
//!
//! A missing workspace or Service falls through to the next step. Any other
//! lookup failure is returned as [`ProxyError::Catalog`] rather than guessed
//! around. A headless Service still lends its preferred port to step 4.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::catalog::{ServiceInfo, WorkloadCatalog};
use crate::error::{ProxyError, Result};
use corridor_common::names::sanitize;
use corridor_common::net::{join_host_port, scheme_for_port, split_host_port, DEFAULT_HTTP_PORT};

/// Cluster-local DNS suffix for Service names
pub const CLUSTER_DOMAIN: &str = "svc.cluster.local";

/// Which step produced a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    /// Workspace status field
    Status,
    /// Service lookup
    Service,
    /// Configured override
    Override,
    /// DNS fallback
    Dns,
}

impl fmt::Display for TargetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetSource::Status => "status",
            TargetSource::Service => "service",
            TargetSource::Override => "override",
            TargetSource::Dns => "dns",
        })
    }
}

/// Canonical upstream for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// `http` or `https`
    pub scheme: String,
    /// `host:port`
    pub hostport: String,
    /// Path on the upstream
    pub subpath: String,
    /// Service name to use for API server service-proxy paths
    pub service: Option<String>,
    /// Resolution step that produced this target
    pub source: TargetSource,
}

impl ResolvedTarget {
    /// Port of `hostport`
    pub fn port(&self) -> Option<u16> {
        split_host_port(&self.hostport).map(|(_, port)| port)
    }
}

/// Resolves workload identifiers within one cluster
#[derive(Clone)]
pub struct ServiceResolver {
    catalog: Arc<dyn WorkloadCatalog>,
    namespace: String,
    overrides: HashMap<String, String>,
}

impl ServiceResolver {
    /// Create a resolver for `namespace` with per-workload overrides
    pub fn new(
        catalog: Arc<dyn WorkloadCatalog>,
        namespace: impl Into<String>,
        overrides: HashMap<String, String>,
    ) -> Self {
        Self {
            catalog,
            namespace: namespace.into(),
            overrides,
        }
    }

    /// Namespace searched
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolve `id` to a target serving `subpath`
    pub async fn resolve(&self, id: &str, subpath: &str) -> Result<ResolvedTarget> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ProxyError::TargetNotResolved {
                workload: id.to_string(),
                namespace: self.namespace.clone(),
            });
        }
        let ns = self.namespace.as_str();

        match self.catalog.status_target(ns, id).await {
            Ok(Some(raw)) => match parse_status_target(&raw) {
                Some((scheme, hostport)) => {
                    return Ok(self.target(scheme, hostport, subpath, None, TargetSource::Status))
                }
                None => warn!(workload = %id, value = %raw, "Ignoring malformed proxyTarget"),
            },
            Ok(None) => {}
            Err(e) => return Err(ProxyError::catalog(id, e)),
        }

        let mut dns_port = None;
        match self.catalog.find_service(ns, id).await {
            Ok(Some(service)) => match service_address(&service) {
                Some((scheme, hostport)) => {
                    let name = Some(service.name.clone());
                    return Ok(self.target(scheme, hostport, subpath, name, TargetSource::Service));
                }
                None => {
                    debug!(
                        workload = %id,
                        service = %service.name,
                        "Service is headless or has no ports"
                    );
                    dns_port = pick_port(&service.ports);
                }
            },
            Ok(None) => {}
            Err(e) => return Err(ProxyError::catalog(id, e)),
        }

        if let Some(raw) = self.overrides.get(id) {
            match parse_override(raw) {
                Some((scheme, hostport)) => {
                    return Ok(self.target(scheme, hostport, subpath, None, TargetSource::Override))
                }
                None => warn!(workload = %id, value = %raw, "Ignoring malformed address override"),
            }
        }

        let name = sanitize(id);
        let host = format!("{}.{}.{}", name, ns, CLUSTER_DOMAIN);
        let port = dns_port.unwrap_or(DEFAULT_HTTP_PORT);
        let hostport = join_host_port(&host, port);
        Ok(self.target(
            scheme_for_port(port).to_string(),
            hostport,
            subpath,
            Some(name),
            TargetSource::Dns,
        ))
    }

    fn target(
        &self,
        scheme: String,
        hostport: String,
        subpath: &str,
        service: Option<String>,
        source: TargetSource,
    ) -> ResolvedTarget {
        debug!(%source, %scheme, %hostport, "Resolved workload");
        ResolvedTarget {
            scheme,
            hostport,
            subpath: subpath.to_string(),
            service,
            source,
        }
    }
}

/// Pick a port: 8443/443 (https) before 8080 (http) before the first declared.
///
/// # Examples
///
/// ```
/// use corridor_proxy::resolver::pick_port;
///
/// assert_eq!(pick_port(&[80, 8080, 8443]), Some(8443));
/// assert_eq!(pick_port(&[9000, 8080]), Some(8080));
/// assert_eq!(pick_port(&[9000, 9001]), Some(9000));
/// assert_eq!(pick_port(&[]), None);
/// ```
pub fn pick_port(ports: &[u16]) -> Option<u16> {
    ports
        .iter()
        .find(|p| matches!(**p, 443 | 8443))
        .or_else(|| ports.iter().find(|p| **p == DEFAULT_HTTP_PORT))
        .or_else(|| ports.first())
        .copied()
}

/// `(scheme, ClusterIP:port)` for a routable Service
pub fn service_address(service: &ServiceInfo) -> Option<(String, String)> {
    let ip = service.routable_ip()?;
    let port = pick_port(&service.ports)?;
    Some((scheme_for_port(port).to_string(), join_host_port(ip, port)))
}

fn parse_status_target(raw: &str) -> Option<(String, String)> {
    let (scheme, rest) = raw.trim().split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let authority = rest.split('/').next().unwrap_or("");
    let hostport = match split_host_port(authority) {
        Some((host, port)) => join_host_port(host, port),
        None if !authority.is_empty() && !authority.contains(':') => {
            let port = if scheme == "https" { 443 } else { 80 };
            join_host_port(authority, port)
        }
        None => return None,
    };
    Some((scheme, hostport))
}

fn parse_override(raw: &str) -> Option<(String, String)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match split_host_port(raw) {
        Some((host, port)) => Some((scheme_for_port(port).to_string(), join_host_port(host, port))),
        None if !raw.contains(['/', ':']) => Some((
            scheme_for_port(DEFAULT_HTTP_PORT).to_string(),
            join_host_port(raw, DEFAULT_HTTP_PORT),
        )),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockWorkloadCatalog;
    use corridor_common::{Classify, ErrorClass};
    use rstest::rstest;

    fn empty_catalog() -> MockWorkloadCatalog {
        let mut catalog = MockWorkloadCatalog::new();
        catalog.expect_status_target().returning(|_, _| Ok(None));
        catalog.expect_find_service().returning(|_, _| Ok(None));
        catalog
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "lookup failed".into(),
            reason: "InternalError".into(),
            code,
        })
    }

    fn service(name: &str, ip: &str, ports: &[u16]) -> ServiceInfo {
        ServiceInfo {
            name: name.into(),
            cluster_ip: Some(ip.into()),
            ports: ports.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dns_fallback_sanitizes_the_identifier() {
        let resolver = ServiceResolver::new(Arc::new(empty_catalog()), "default", HashMap::new());
        let target = resolver.resolve("My App!!", "/").await.unwrap();
        assert_eq!(target.hostport, "my-app.default.svc.cluster.local:8080");
        assert_eq!(target.port(), Some(8080));
        assert_eq!(target.scheme, "http");
        assert_eq!(target.source, TargetSource::Dns);
        assert_eq!(target.service.as_deref(), Some("my-app"));
    }

    #[tokio::test]
    async fn status_beats_everything() {
        let mut catalog = MockWorkloadCatalog::new();
        catalog
            .expect_status_target()
            .withf(|ns, id| ns == "apps" && id == "ws1")
            .returning(|_, _| Ok(Some("https://10.0.0.7:8443".into())));
        catalog.expect_find_service().times(0);
        let overrides = HashMap::from([("ws1".to_string(), "127.0.0.1:9000".to_string())]);

        let resolver = ServiceResolver::new(Arc::new(catalog), "apps", overrides);
        let target = resolver.resolve("ws1", "/x").await.unwrap();
        assert_eq!(target.scheme, "https");
        assert_eq!(target.hostport, "10.0.0.7:8443");
        assert_eq!(target.subpath, "/x");
        assert_eq!(target.source, TargetSource::Status);
    }

    #[tokio::test]
    async fn service_beats_override() {
        let mut catalog = MockWorkloadCatalog::new();
        catalog.expect_status_target().returning(|_, _| Ok(None));
        catalog
            .expect_find_service()
            .returning(|_, _| Ok(Some(service("ws1-svc", "10.96.0.12", &[80, 8080]))));
        let overrides = HashMap::from([("ws1".to_string(), "127.0.0.1:9000".to_string())]);

        let resolver = ServiceResolver::new(Arc::new(catalog), "default", overrides);
        let target = resolver.resolve("ws1", "/").await.unwrap();
        assert_eq!(target.hostport, "10.96.0.12:8080");
        assert_eq!(target.scheme, "http");
        assert_eq!(target.service.as_deref(), Some("ws1-svc"));
        assert_eq!(target.source, TargetSource::Service);
    }

    #[tokio::test]
    async fn headless_service_falls_through_to_override() {
        let mut catalog = MockWorkloadCatalog::new();
        catalog.expect_status_target().returning(|_, _| Ok(None));
        catalog
            .expect_find_service()
            .returning(|_, _| Ok(Some(service("ws1", "None", &[8080]))));
        let overrides = HashMap::from([("ws1".to_string(), "ws1.lan".to_string())]);

        let resolver = ServiceResolver::new(Arc::new(catalog), "default", overrides);
        let target = resolver.resolve("ws1", "/").await.unwrap();
        assert_eq!(target.hostport, "ws1.lan:8080");
        assert_eq!(target.source, TargetSource::Override);
    }

    #[tokio::test]
    async fn headless_service_port_carries_into_dns() {
        let mut catalog = MockWorkloadCatalog::new();
        catalog.expect_status_target().returning(|_, _| Ok(None));
        catalog
            .expect_find_service()
            .returning(|_, _| Ok(Some(service("ws1", "None", &[9000, 8443]))));

        let resolver = ServiceResolver::new(Arc::new(catalog), "default", HashMap::new());
        let target = resolver.resolve("ws1", "/").await.unwrap();
        assert_eq!(target.hostport, "ws1.default.svc.cluster.local:8443");
        assert_eq!(target.scheme, "https");
        assert_eq!(target.source, TargetSource::Dns);
    }

    #[tokio::test]
    async fn unreachable_api_server_is_a_connect_error() {
        let mut catalog = MockWorkloadCatalog::new();
        catalog
            .expect_status_target()
            .returning(|_, _| Err(kube::Error::Service("connection refused".into())));
        catalog.expect_find_service().times(0);
        let overrides = HashMap::from([("ws1".to_string(), "127.0.0.1:9000".to_string())]);

        let resolver = ServiceResolver::new(Arc::new(catalog), "default", overrides);
        let err = resolver.resolve("ws1", "/").await.unwrap_err();
        assert!(matches!(err, ProxyError::Catalog { .. }), "{:?}", err);
        assert_eq!(err.class(), ErrorClass::Connect);
        assert_eq!(err.status().as_u16(), 503);
    }

    #[rstest]
    #[case(500, ErrorClass::Connect)]
    #[case(403, ErrorClass::Config)]
    #[tokio::test]
    async fn service_lookup_errors_are_returned(#[case] code: u16, #[case] class: ErrorClass) {
        let mut catalog = MockWorkloadCatalog::new();
        catalog.expect_status_target().returning(|_, _| Ok(None));
        catalog
            .expect_find_service()
            .returning(move |_, _| Err(api_error(code)));

        let resolver = ServiceResolver::new(Arc::new(catalog), "default", HashMap::new());
        let err = resolver.resolve("ws1", "/").await.unwrap_err();
        assert_eq!(err.class(), class);
    }

    #[tokio::test]
    async fn malformed_status_is_skipped() {
        let mut catalog = MockWorkloadCatalog::new();
        catalog
            .expect_status_target()
            .returning(|_, _| Ok(Some("ftp://x:21".into())));
        catalog
            .expect_find_service()
            .returning(|_, _| Ok(Some(service("ws1", "10.96.0.3", &[443]))));
        let resolver = ServiceResolver::new(Arc::new(catalog), "default", HashMap::new());
        let target = resolver.resolve("ws1", "/").await.unwrap();
        assert_eq!(target.scheme, "https");
        assert_eq!(target.hostport, "10.96.0.3:443");
    }

    #[tokio::test]
    async fn blank_identifier_is_not_resolved() {
        let mut catalog = MockWorkloadCatalog::new();
        catalog.expect_status_target().times(0);
        let resolver = ServiceResolver::new(Arc::new(catalog), "default", HashMap::new());
        let err = resolver.resolve("  ", "/").await.unwrap_err();
        assert!(matches!(err, ProxyError::TargetNotResolved { .. }));
    }

    #[rstest]
    #[case("https://10.0.0.1:8443", Some(("https", "10.0.0.1:8443")))]
    #[case("http://ws1.default.svc:8080/ignored", Some(("http", "ws1.default.svc:8080")))]
    #[case("HTTPS://host", Some(("https", "host:443")))]
    #[case("10.0.0.1:8080", None)]
    #[case("tcp://10.0.0.1:8080", None)]
    #[case("http://", None)]
    fn status_target_parsing(#[case] raw: &str, #[case] expected: Option<(&str, &str)>) {
        let parsed = parse_status_target(raw);
        let expected = expected.map(|(s, h)| (s.to_string(), h.to_string()));
        assert_eq!(parsed, expected);
    }

    #[rstest]
    #[case("10.0.0.9:8443", Some(("https", "10.0.0.9:8443")))]
    #[case("10.0.0.9", Some(("http", "10.0.0.9:8080")))]
    #[case("", None)]
    #[case("http://x", None)]
    fn override_parsing(#[case] raw: &str, #[case] expected: Option<(&str, &str)>) {
        let expected = expected.map(|(s, h)| (s.to_string(), h.to_string()));
        assert_eq!(parse_override(raw), expected);
    }
}
