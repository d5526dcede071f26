//! HTTP(S) front door

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::ProxyEngine;
use crate::error::ProxyError;

/// Grace period for in-flight requests on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// PEM files for the HTTPS listener
#[derive(Debug, Clone)]
pub struct TlsFiles {
    /// Certificate chain
    pub cert: PathBuf,
    /// Private key
    pub key: PathBuf,
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// Serve HTTPS with these files; plain HTTP when None
    pub tls: Option<TlsFiles>,
}

/// Errors starting or running the listener
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Certificate or key could not be loaded
    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),

    /// The listener failed
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
struct ClusterPath {
    cluster: String,
}

/// Routes served by the proxy
pub fn router(engine: ProxyEngine) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/clusters", get(list_clusters))
        .route("/api/clusters/{cluster}", delete(close_cluster))
        // Default cluster mount
        .route("/proxy", any(default_proxy))
        .route("/proxy/{*rest}", any(default_proxy))
        // Explicit cluster mount
        .route("/api/cluster/{cluster}/proxy", any(cluster_proxy))
        .route("/api/cluster/{cluster}/proxy/{*rest}", any(cluster_proxy))
        .with_state(engine)
}

async fn default_proxy(State(engine): State<ProxyEngine>, request: Request<Body>) -> Response {
    engine.handle(None, request).await
}

async fn cluster_proxy(
    State(engine): State<ProxyEngine>,
    Path(params): Path<ClusterPath>,
    request: Request<Body>,
) -> Response {
    engine.handle(Some(params.cluster), request).await
}

async fn list_clusters(State(engine): State<ProxyEngine>) -> Response {
    Json(engine.directory().list().await).into_response()
}

async fn close_cluster(
    State(engine): State<ProxyEngine>,
    Path(params): Path<ClusterPath>,
) -> Response {
    if engine.directory().close(&params.cluster).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        ProxyError::BadTarget(format!("cluster {} is not running", params.cluster)).into_response()
    }
}

/// Serve `engine` until `shutdown` fires, then drain for [`SHUTDOWN_GRACE`]
pub async fn serve(
    config: ServerConfig,
    engine: ProxyEngine,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = router(engine);
    let handle = Handle::new();
    let drain = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        drain.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    match config.tls {
        Some(files) => {
            let tls = RustlsConfig::from_pem_file(&files.cert, &files.key)
                .await
                .map_err(ServerError::Tls)?;
            info!(addr = %config.addr, "Starting HTTPS proxy server");
            axum_server::bind_rustls(config.addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!(addr = %config.addr, "Starting HTTP proxy server");
            axum_server::bind(config.addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }
    info!("Proxy server stopped");
    Ok(())
}
