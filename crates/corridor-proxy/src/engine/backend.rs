//! Registry-backed implementations of the engine's cluster seams

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderMap, Request, Response};
use tokio_util::sync::CancellationToken;

use corridor_cluster::{
    ApiTransport, BoxError, ClusterInstance, ClusterRegistry, ClusterStatus, ProxyBody,
    WorkloadClient,
};

use super::{ClusterBackend, ClusterDirectory};
use crate::api_proxy::ApiProxyAdapter;
use crate::catalog::{KubeCatalog, WorkloadCatalog};
use crate::error::Result;
use crate::resolver::ServiceResolver;
use crate::routing::{ProxyRoute, Target};
use crate::strategy::{take_fallback, Attempt, Plan, Strategy, Upstream, Via};

/// [`ClusterDirectory`] over a [`ClusterRegistry`]
pub struct RegistryDirectory {
    registry: Arc<ClusterRegistry>,
}

impl RegistryDirectory {
    /// Wrap `registry`
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ClusterDirectory for RegistryDirectory {
    async fn backend(&self, cluster: &str) -> Result<Arc<dyn ClusterBackend>> {
        let instance = self.registry.get(cluster).await?;
        Ok(Arc::new(InstanceBackend::new(instance)))
    }

    async fn list(&self) -> Vec<ClusterStatus> {
        self.registry.list().await
    }

    async fn close(&self, cluster: &str) -> bool {
        // Teardown finishes even if the admin request goes away
        let registry = self.registry.clone();
        let cluster = cluster.to_string();
        tokio::spawn(async move { registry.close(&cluster).await })
            .await
            .unwrap_or(false)
    }
}

/// Routing for one ready cluster instance
pub struct InstanceBackend {
    instance: Arc<ClusterInstance>,
    resolver: ServiceResolver,
    adapter: Option<ApiProxyAdapter>,
}

impl InstanceBackend {
    /// Build the resolver and adapter for `instance`
    pub fn new(instance: Arc<ClusterInstance>) -> Self {
        let catalog: Arc<dyn WorkloadCatalog> =
            Arc::new(KubeCatalog::new(instance.client.clone()));
        let resolver = ServiceResolver::new(
            catalog.clone(),
            instance.namespace(),
            instance.identity.overrides.clone(),
        );
        let adapter = ApiProxyAdapter::new(
            &instance.identity.policy,
            instance.api.base().clone(),
            catalog,
            instance.clone(),
        );
        Self {
            instance,
            resolver,
            adapter,
        }
    }
}

#[async_trait]
impl ClusterBackend for InstanceBackend {
    async fn plan(&self, route: &ProxyRoute, headers: &mut HeaderMap) -> Result<Plan> {
        let pq = route.path_and_query();
        let id = match &route.target {
            Target::Address { scheme, .. } => {
                let hostport = route.target.hostport().unwrap_or_default();
                return Ok(Plan::new(Attempt::direct(
                    Strategy::DirectDial,
                    scheme,
                    &hostport,
                    &pq,
                )?));
            }
            Target::Workload { id } => id,
        };

        let resolved = self.resolver.resolve(id, &route.subpath).await?;
        let primary = match &self.adapter {
            Some(adapter) => adapter.rewrite(id, &resolved, &pq, headers).await?,
            None => Attempt::direct(
                Strategy::DirectDial,
                &resolved.scheme,
                &resolved.hostport,
                &pq,
            )?,
        };
        let plan = Plan::new(primary);
        Ok(match take_fallback(headers, &pq) {
            Some(fallback) => plan.with_fallback(fallback),
            None => plan,
        })
    }

    fn upstream(&self) -> Arc<dyn Upstream> {
        Arc::new(InstanceUpstream::new(
            self.instance.api.clone(),
            self.instance.workload.clone(),
        ))
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.instance.cancel.child_token()
    }
}

/// [`Upstream`] over a cluster's API transport and workload client
#[derive(Clone)]
pub struct InstanceUpstream {
    api: ApiTransport,
    workload: WorkloadClient,
}

impl InstanceUpstream {
    /// Carry attempts over `api` and `workload`
    pub fn new(api: ApiTransport, workload: WorkloadClient) -> Self {
        Self { api, workload }
    }
}

#[async_trait]
impl Upstream for InstanceUpstream {
    async fn send(
        &self,
        via: &Via,
        request: Request<ProxyBody>,
    ) -> std::result::Result<Response<Body>, BoxError> {
        let response = match via {
            Via::Workload => self.workload.send(request).await?,
            Via::ApiServer { base } => self.api.send_to(base, request).await?,
        };
        Ok(response.map(Body::new))
    }
}
