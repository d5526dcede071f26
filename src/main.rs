//! Corridor - multi-cluster reverse proxy
//!
//! `corridor serve` (the default) runs the proxy. `corridor check` builds one
//! cluster instance, prints its status and exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use corridor::config::{Config, FileIdentitySource, DEFAULT_LISTEN};
use corridor_cluster::{ClusterRegistry, ClusterStatus, ConnectorHealth, RegistrySettings};
use corridor_common::telemetry::{init_telemetry, shutdown_telemetry, LogFormat, TelemetryConfig};
use corridor_proxy::{EngineConfig, ProxyEngine, RegistryDirectory, ServerConfig, TlsFiles};

#[derive(Parser, Debug)]
#[command(name = "corridor", version, about = "Multi-cluster reverse proxy", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "CORRIDOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log line format (json or text)
    #[arg(long, env = "CORRIDOR_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy server (default)
    Serve(ServeArgs),
    /// Connect to one cluster and print its status
    Check {
        /// Cluster ID
        #[arg(long)]
        cluster: String,
    },
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "CORRIDOR_LISTEN")]
    listen: Option<SocketAddr>,

    /// Parent directory for per-cluster overlay state
    #[arg(long, env = "CORRIDOR_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Cluster served under /proxy
    #[arg(long, env = "CORRIDOR_DEFAULT_CLUSTER")]
    default_cluster: Option<String>,

    /// Largest request body accepted, in bytes
    #[arg(long, env = "CORRIDOR_MAX_BODY_BYTES")]
    max_body_bytes: Option<usize>,

    /// TLS certificate chain (PEM)
    #[arg(long, env = "CORRIDOR_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "CORRIDOR_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let result = match cli.command {
        Some(Commands::Serve(args)) => run_serve(config, args).await,
        Some(Commands::Check { cluster }) => run_check(config, &cluster).await,
        None => run_serve(config, cli.serve).await,
    };
    shutdown_telemetry();
    result
}

fn registry(config: &Config, state_dir: Option<PathBuf>) -> Arc<ClusterRegistry> {
    let mut settings = RegistrySettings::default();
    if let Some(root) = state_dir.or_else(|| config.server.state_dir.clone()) {
        settings.state_root = root;
    }
    let source = Arc::new(FileIdentitySource::new(config.clusters.clone()));
    Arc::new(ClusterRegistry::new(source, settings))
}

async fn run_serve(config: Config, args: ServeArgs) -> anyhow::Result<()> {
    let addr = match args.listen.or(config.server.listen) {
        Some(addr) => addr,
        None => DEFAULT_LISTEN.parse().context("invalid default listen address")?,
    };
    let tls = match (args.tls_cert, args.tls_key) {
        (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
        _ => config.server.tls.as_ref().map(|t| TlsFiles {
            cert: t.cert.clone(),
            key: t.key.clone(),
        }),
    };

    let mut engine_config = EngineConfig {
        default_cluster: args
            .default_cluster
            .or_else(|| config.server.default_cluster.clone()),
        tls: tls.is_some(),
        ..Default::default()
    };
    if let Some(limit) = args.max_body_bytes.or(config.server.max_body_bytes) {
        engine_config.max_body_bytes = limit;
    }
    if let Some(default) = &engine_config.default_cluster {
        if !config.clusters.contains_key(default) {
            warn!(cluster = %default, "Default cluster is not configured");
        }
    }

    let registry = registry(&config, args.state_dir);
    info!(
        clusters = config.clusters.len(),
        default_cluster = ?engine_config.default_cluster,
        max_body_bytes = engine_config.max_body_bytes,
        "Starting corridor"
    );
    let engine = ProxyEngine::new(
        Arc::new(RegistryDirectory::new(registry.clone())),
        engine_config,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let result = corridor_proxy::serve(ServerConfig { addr, tls }, engine, shutdown.clone()).await;
    shutdown.cancel();
    registry.shutdown_all().await;
    result.context("proxy server failed")
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    let interrupt = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = interrupt => info!("Received SIGINT"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                tokio::select! {
                    _ = interrupt => info!("Received SIGINT"),
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
    #[cfg(not(unix))]
    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[derive(Serialize)]
struct CheckReport {
    status: Option<ClusterStatus>,
    health: ConnectorHealth,
}

async fn run_check(config: Config, cluster: &str) -> anyhow::Result<()> {
    let registry = registry(&config, None);
    let outcome = async {
        let instance = registry
            .get(cluster)
            .await
            .with_context(|| format!("cluster {} is not reachable", cluster))?;
        let report = CheckReport {
            status: registry.list().await.into_iter().find(|s| s.id == cluster),
            health: instance.connector.health().await,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        anyhow::Ok(())
    }
    .await;
    registry.shutdown_all().await;
    outcome
}
