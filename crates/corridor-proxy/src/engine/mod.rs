//! The reverse-proxy request path
//!
//! For each inbound request [`ProxyEngine::handle`]:
//! 1. Parses the addressing form into a [`ProxyRoute`]
//! 2. Buffers the body up to the cap before touching any cluster, so an
//!    oversized body fails before a dial and a fallback can resend it
//! 3. Asks the cluster's [`ClusterBackend`] for a [`Plan`]
//! 4. Dispatches the plan, with one fallback hop on dial failure
//! 5. Relays upgrades as raw streams, or rewrites response headers for
//!    iframe display
//!
//! Every failure becomes a Kubernetes `Status` response; a panic anywhere in
//! the request path becomes a 500 and is logged.

mod backend;

pub use backend::{InstanceBackend, InstanceUpstream, RegistryDirectory};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::FutureExt;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use corridor_cluster::ClusterStatus;
use corridor_common::Classify;

use crate::error::{ProxyError, Result};
use crate::rewrite::{rewrite_response_headers, upstream_headers};
use crate::routing::{parse_route, ProxyRoute};
use crate::strategy::{dispatch, Outbound, Plan, Upstream};
use crate::upgrade::{is_upgrade, relay, take_inbound};

/// Default request body cap
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Default bound on an upstream round trip (until response headers)
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// One cluster as the engine sees it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Plan how to reach `route`'s upstream. `headers` are the prepared
    /// upstream headers; planning may consume entries from them.
    async fn plan(&self, route: &ProxyRoute, headers: &mut HeaderMap) -> Result<Plan>;

    /// Client that carries the plan's attempts
    fn upstream(&self) -> Arc<dyn Upstream>;

    /// Fires when the cluster is torn down
    fn shutdown_token(&self) -> CancellationToken;
}

/// Lookup of clusters by ID
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// Backend for `cluster`, constructing the cluster if needed
    async fn backend(&self, cluster: &str) -> Result<Arc<dyn ClusterBackend>>;

    /// Status of every known cluster
    async fn list(&self) -> Vec<ClusterStatus>;

    /// Tear down `cluster`; whether a ready instance existed
    async fn close(&self, cluster: &str) -> bool;
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest request body accepted
    pub max_body_bytes: usize,
    /// Bound on each upstream round trip
    pub upstream_timeout: Duration,
    /// Cluster used by the `/proxy` mount
    pub default_cluster: Option<String>,
    /// Whether the listener terminates TLS
    pub tls: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            default_cluster: None,
            tls: false,
        }
    }
}

/// The reverse proxy
#[derive(Clone)]
pub struct ProxyEngine {
    directory: Arc<dyn ClusterDirectory>,
    config: Arc<EngineConfig>,
}

impl ProxyEngine {
    /// Create an engine over `directory`
    pub fn new(directory: Arc<dyn ClusterDirectory>, config: EngineConfig) -> Self {
        Self {
            directory,
            config: Arc::new(config),
        }
    }

    /// Cluster directory
    pub fn directory(&self) -> &Arc<dyn ClusterDirectory> {
        &self.directory
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Proxy one request to `cluster`, or the default cluster when None.
    /// Never fails: errors and panics become responses.
    pub async fn handle(&self, cluster: Option<String>, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        match AssertUnwindSafe(self.proxy(cluster, request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let status = e.status();
                if status.is_server_error() {
                    warn!(
                        %method,
                        %path,
                        status = status.as_u16(),
                        class = e.class().as_str(),
                        error = %e,
                        "Proxy request failed"
                    );
                } else {
                    debug!(%method, %path, status = status.as_u16(), error = %e, "Proxy request rejected");
                }
                e.into_response()
            }
            Err(panic) => {
                error!(
                    %method,
                    %path,
                    panic = panic_message(panic.as_ref()),
                    "Proxy request panicked"
                );
                ProxyError::Internal("request handling failed".into()).into_response()
            }
        }
    }

    #[instrument(
        skip(self, request),
        fields(method = %request.method(), path = %request.uri().path())
    )]
    async fn proxy(
        &self,
        cluster: Option<String>,
        mut request: Request<Body>,
    ) -> Result<Response<Body>> {
        let cluster = cluster
            .or_else(|| self.config.default_cluster.clone())
            .ok_or_else(|| {
                ProxyError::BadTarget("no cluster addressed and no default cluster".into())
            })?;
        let uri = request.uri().clone();
        let route = parse_route(uri.path(), uri.query())?;

        let upgrade = is_upgrade(request.headers());
        let inbound = if upgrade {
            Some(take_inbound(&mut request)?)
        } else {
            None
        };

        let (parts, body) = request.into_parts();
        let body = read_body(body, &parts.headers, self.config.max_body_bytes).await?;

        let backend = self.directory.backend(&cluster).await?;
        let mut headers = upstream_headers(&parts.headers, &route.prefix, self.config.tls, upgrade);
        let plan = backend.plan(&route, &mut headers).await?;
        let target = plan.primary().target();
        debug!(
            %cluster,
            strategy = %plan.primary().strategy,
            %target,
            fallback = plan.attempts().len() > 1,
            "Dispatching"
        );

        let outbound = Outbound {
            method: parts.method,
            headers,
            body,
        };
        let upstream = backend.upstream();
        let mut response =
            dispatch(upstream.as_ref(), &plan, &outbound, self.config.upstream_timeout).await?;

        if let Some(inbound) = inbound {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                return relay(inbound, response, backend.shutdown_token(), target);
            }
            debug!(%target, status = response.status().as_u16(), "Upstream declined upgrade");
        }
        rewrite_response_headers(response.headers_mut(), &route.prefix);
        Ok(response)
    }
}

/// Buffer a request body, failing with PayloadTooLarge past `limit`
async fn read_body(body: Body, headers: &HeaderMap, limit: usize) -> Result<Bytes> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(ProxyError::PayloadTooLarge { limit });
    }
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ProxyError::PayloadTooLarge { limit })
        }
        Err(e) => Err(ProxyError::RequestBody(e.to_string())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
