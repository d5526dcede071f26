//! Kubernetes lookups used to resolve and route workloads

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Api;

use corridor_common::WORKLOAD_ID_LABEL;

/// Group of the workspace custom resource
pub const WORKSPACE_GROUP: &str = "corridor.io";
/// Version of the workspace custom resource
pub const WORKSPACE_VERSION: &str = "v1alpha1";
/// Kind of the workspace custom resource
pub const WORKSPACE_KIND: &str = "Workspace";

/// The parts of a Service the proxy cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service name
    pub name: String,
    /// ClusterIP; None or `"None"` for headless Services
    pub cluster_ip: Option<String>,
    /// Declared ports in order
    pub ports: Vec<u16>,
    /// Pod selector
    pub selector: BTreeMap<String, String>,
}

impl ServiceInfo {
    /// ClusterIP if the Service has a usable one
    pub fn routable_ip(&self) -> Option<&str> {
        self.cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
    }

    /// Selector rendered as a label selector string, or None when empty
    pub fn label_selector(&self) -> Option<String> {
        if self.selector.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        Some(parts.join(","))
    }
}

/// The parts of a Pod the proxy cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Phase is Running
    pub running: bool,
    /// Ready condition is True
    pub ready: bool,
}

/// Read-only view of one cluster's workloads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadCatalog: Send + Sync {
    /// `status.proxyTarget` of the workspace named `id`, if published
    async fn status_target(&self, namespace: &str, id: &str) -> Result<Option<String>, kube::Error>;

    /// The Service named `id`, else the first labeled with the workload ID
    async fn find_service(&self, namespace: &str, id: &str)
        -> Result<Option<ServiceInfo>, kube::Error>;

    /// Pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>, kube::Error>;
}

/// [`WorkloadCatalog`] backed by a cluster's kube client
#[derive(Clone)]
pub struct KubeCatalog {
    client: kube::Client,
    workspaces: ApiResource,
}

impl KubeCatalog {
    /// Create a catalog over `client`
    pub fn new(client: kube::Client) -> Self {
        let gvk = GroupVersionKind::gvk(WORKSPACE_GROUP, WORKSPACE_VERSION, WORKSPACE_KIND);
        Self {
            client,
            workspaces: ApiResource::from_gvk(&gvk),
        }
    }
}

#[async_trait]
impl WorkloadCatalog for KubeCatalog {
    async fn status_target(&self, namespace: &str, id: &str) -> Result<Option<String>, kube::Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.workspaces);
        let Some(workspace) = api.get_opt(id).await? else {
            return Ok(None);
        };
        Ok(workspace
            .data
            .get("status")
            .and_then(|status| status.get("proxyTarget"))
            .and_then(|target| target.as_str())
            .map(str::trim)
            .filter(|target| !target.is_empty())
            .map(str::to_string))
    }

    async fn find_service(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<Option<ServiceInfo>, kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        if let Some(service) = api.get_opt(id).await? {
            return Ok(Some(service_info(service)));
        }
        let lp = ListParams::default().labels(&format!("{}={}", WORKLOAD_ID_LABEL, id));
        let list = api.list(&lp).await?;
        Ok(list.items.into_iter().next().map(service_info))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items.into_iter().map(pod_info).collect())
    }
}

fn service_info(service: Service) -> ServiceInfo {
    let name = service.metadata.name.unwrap_or_default();
    let spec = service.spec.unwrap_or_default();
    let ports = spec
        .ports
        .unwrap_or_default()
        .iter()
        .filter_map(|p| u16::try_from(p.port).ok())
        .collect();
    ServiceInfo {
        name,
        cluster_ip: spec.cluster_ip,
        ports,
        selector: spec.selector.unwrap_or_default(),
    }
}

fn pod_info(pod: Pod) -> PodInfo {
    let name = pod.metadata.name.unwrap_or_default();
    let status = pod.status.unwrap_or_default();
    let running = status.phase.as_deref() == Some("Running");
    let ready = status
        .conditions
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    PodInfo {
        name,
        running,
        ready,
    }
}
