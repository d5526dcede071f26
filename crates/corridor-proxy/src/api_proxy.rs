//! Routing workload traffic through the cluster's API server
//!
//! [`ApiProxyAdapter::rewrite`] turns a resolved workload target into one
//! [`Attempt`]:
//! - loopback targets are dialed directly
//! - with port-forwarding enabled and a pod found, a local forward is
//!   ensured and the Service ClusterIP is stashed as the fallback
//! - with pod-proxy preferred and a pod found, `pods/{pod}/proxy`
//! - otherwise `services/{svc}/proxy`
//!
//! The adapter does not exist for clusters whose policy disables the API
//! proxy; their workloads are dialed directly through the connector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Uri};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use corridor_cluster::{ClusterInstance, ForwardError};
use corridor_common::names::sanitize;
use corridor_common::net::{force_http, is_loopback_hostport, join_host_port, uri_is_loopback};
use corridor_common::{
    ClusterPolicy, FALLBACK_HOSTPORT_HEADER, FALLBACK_SCHEME_HEADER, WORKLOAD_ID_LABEL,
};

use crate::catalog::{PodInfo, ServiceInfo, WorkloadCatalog};
use crate::error::{ProxyError, Result};
use crate::resolver::{service_address, ResolvedTarget};
use crate::strategy::{Attempt, Strategy};

/// Where `kubectl proxy` listens by default
pub const LOCAL_KUBE_PROXY: &str = "127.0.0.1:8001";

/// Bound on the API server reachability check
pub const BASE_CHECK_TIMEOUT: Duration = Duration::from_millis(250);

/// Source of local port-forwards
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForwardProvider: Send + Sync {
    /// Local port forwarding to `pod:port`
    async fn ensure(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> std::result::Result<u16, ForwardError>;
}

#[async_trait]
impl ForwardProvider for ClusterInstance {
    async fn ensure(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> std::result::Result<u16, ForwardError> {
        self.forwards.ensure(namespace, pod, port).await
    }
}

/// Per-cluster rewrite of workload requests onto API server paths
pub struct ApiProxyAdapter {
    base: Uri,
    overridden: bool,
    namespace: String,
    prefer_pod: bool,
    use_port_forward: bool,
    catalog: Arc<dyn WorkloadCatalog>,
    forwards: Arc<dyn ForwardProvider>,
}

impl ApiProxyAdapter {
    /// Build the adapter for a cluster; None when its policy disables the
    /// API proxy.
    ///
    /// `base` is the API server URL the cluster's clients use, with any
    /// policy override already applied.
    pub fn new(
        policy: &ClusterPolicy,
        base: Uri,
        catalog: Arc<dyn WorkloadCatalog>,
        forwards: Arc<dyn ForwardProvider>,
    ) -> Option<Self> {
        if policy.disable_api_proxy {
            return None;
        }
        Some(Self {
            base,
            overridden: policy.api_proxy_url().is_some(),
            namespace: policy.namespace().to_string(),
            prefer_pod: policy.prefer_pod_proxy || policy.use_port_forward,
            use_port_forward: policy.use_port_forward,
            catalog,
            forwards,
        })
    }

    /// API server base for proxy paths.
    ///
    /// A loopback base that was not explicitly configured is spoken to over
    /// plain http, and replaced by a local `kubectl proxy` when it does not
    /// answer but the proxy does.
    pub async fn api_base(&self) -> Uri {
        if self.overridden || !uri_is_loopback(&self.base) {
            return self.base.clone();
        }
        let base = force_http(&self.base).unwrap_or_else(|_| self.base.clone());
        let host = base.host().unwrap_or("127.0.0.1");
        let addr = join_host_port(host, base.port_u16().unwrap_or(80));
        if reachable(&addr, BASE_CHECK_TIMEOUT).await {
            return base;
        }
        if reachable(LOCAL_KUBE_PROXY, BASE_CHECK_TIMEOUT).await {
            info!(
                base = %self.base,
                proxy = LOCAL_KUBE_PROXY,
                "API server unreachable, using local kubectl proxy"
            );
            return Uri::from_static("http://127.0.0.1:8001");
        }
        base
    }

    /// Choose how to reach `target` for workload `workload`.
    ///
    /// May add the fallback headers to `headers` when the attempt is a
    /// port-forward.
    pub async fn rewrite(
        &self,
        workload: &str,
        target: &ResolvedTarget,
        path_and_query: &str,
        headers: &mut HeaderMap,
    ) -> Result<Attempt> {
        if is_loopback_hostport(&target.hostport) {
            return Attempt::direct(
                Strategy::DirectDial,
                &target.scheme,
                &target.hostport,
                path_and_query,
            );
        }

        let https = target.scheme.eq_ignore_ascii_case("https");
        let proto = if https { "https" } else { "http" };
        let port = target.port().unwrap_or(if https { 443 } else { 80 });
        let ns = self.namespace.as_str();

        if self.prefer_pod {
            let service = self
                .catalog
                .find_service(ns, workload)
                .await
                .map_err(|e| ProxyError::catalog(workload, e))?;
            if let Some(pod) = self.pick_pod(workload, service.as_ref()).await? {
                if self.use_port_forward {
                    let fallback = service.as_ref().and_then(service_address);
                    match self.forwards.ensure(ns, &pod, port).await {
                        Ok(local) => {
                            if let Some((scheme, hostport)) = &fallback {
                                stash_fallback(headers, scheme, hostport)?;
                            }
                            debug!(%workload, %pod, port, local, "Using port-forward");
                            let local = join_host_port("127.0.0.1", local);
                            return Attempt::direct(
                                Strategy::PortForward,
                                "http",
                                &local,
                                path_and_query,
                            );
                        }
                        Err(e) => {
                            warn!(%workload, %pod, port, error = %e, "Port-forward unavailable");
                            if let Some((scheme, hostport)) = fallback {
                                return Attempt::direct(
                                    Strategy::DirectDial,
                                    &scheme,
                                    &hostport,
                                    path_and_query,
                                );
                            }
                        }
                    }
                }
                let path = format!(
                    "/api/v1/namespaces/{}/pods/{}:{}:{}/proxy{}",
                    ns, proto, pod, port, path_and_query
                );
                return Attempt::api(Strategy::PodProxy, self.api_base().await, &path);
            }
        }

        let service = target
            .service
            .clone()
            .unwrap_or_else(|| sanitize(workload));
        let path = format!(
            "/api/v1/namespaces/{}/services/{}:{}:{}/proxy{}",
            ns, proto, service, port, path_and_query
        );
        Attempt::api(Strategy::ServiceProxy, self.api_base().await, &path)
    }

    /// A pod behind the Service's selector, else one labeled with the
    /// workload ID
    async fn pick_pod(
        &self,
        workload: &str,
        service: Option<&ServiceInfo>,
    ) -> Result<Option<String>> {
        let ns = self.namespace.as_str();
        let selectors = service
            .and_then(ServiceInfo::label_selector)
            .into_iter()
            .chain(std::iter::once(format!("{}={}", WORKLOAD_ID_LABEL, workload)));
        for selector in selectors {
            let pods = self
                .catalog
                .list_pods(ns, &selector)
                .await
                .map_err(|e| ProxyError::catalog(workload, e))?;
            if let Some(pod) = choose_pod(&pods) {
                debug!(%workload, %selector, pod = %pod.name, "Selected pod");
                return Ok(Some(pod.name.clone()));
            }
        }
        Ok(None)
    }
}

/// Ready and Running, else Running, else the first pod
pub fn choose_pod(pods: &[PodInfo]) -> Option<&PodInfo> {
    pods.iter()
        .find(|p| p.running && p.ready)
        .or_else(|| pods.iter().find(|p| p.running))
        .or_else(|| pods.first())
}

fn stash_fallback(headers: &mut HeaderMap, scheme: &str, hostport: &str) -> Result<()> {
    let hostport = HeaderValue::from_str(hostport)
        .map_err(|e| ProxyError::Internal(format!("invalid fallback address: {}", e)))?;
    headers.insert(FALLBACK_HOSTPORT_HEADER, hostport);
    let scheme = if scheme == "https" { "https" } else { "http" };
    headers.insert(FALLBACK_SCHEME_HEADER, HeaderValue::from_static(scheme));
    Ok(())
}

async fn reachable(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
