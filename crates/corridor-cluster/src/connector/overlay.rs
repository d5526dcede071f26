//! Overlay-network connector backed by a per-cluster userspace tailscaled
//!
//! Each cluster gets its own `tailscaled` in userspace-networking mode, with
//! its state directory, control socket and a local HTTP CONNECT egress proxy.
//! Dials go through that egress proxy, so nothing touches host routing.
//!
//! Startup sequence:
//! 1. Prepare and lock the state directory
//! 2. Spawn `tailscaled` and wait for its control socket and egress proxy;
//!    a daemon that exits first lost its egress port and is retried on a new
//!    one
//! 3. `tailscale up` against the cluster's login server
//! 4. Poll `tailscale status --json` until the backend is Running

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use super::direct::dial_tcp;
use super::state_dir::{LockError, StateDir, StateLock};
use super::{BoxedIo, ClusterConnector, ConnectorHealth, HealthDetails, HealthState};
use crate::error::ConnectorError;
use corridor_common::names::sanitize;
use corridor_common::OverlayCredentials;

/// Default time allowed for the overlay to reach Running
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single overlay dial
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How often startup polls the daemon
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Bound on a `tailscale status` call
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Egress ports tried before giving up on a daemon that keeps exiting
const EGRESS_ATTEMPTS: usize = 3;

/// Process-wide overlay settings shared by every cluster's connector
#[derive(Debug, Clone)]
pub struct OverlaySettings {
    /// Path or name of the tailscaled binary
    pub daemon_bin: PathBuf,
    /// Path or name of the tailscale CLI
    pub cli_bin: PathBuf,
    /// Bound on reaching Running after start
    pub start_timeout: Duration,
    /// Bound on each dial
    pub dial_timeout: Duration,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            daemon_bin: PathBuf::from("tailscaled"),
            cli_bin: PathBuf::from("tailscale"),
            start_timeout: DEFAULT_START_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// A running daemon and the lock it was started under
struct Daemon {
    child: Child,
    _lock: StateLock,
}

/// Connector that joins a cluster's overlay network
pub struct OverlayConnector {
    cluster_id: String,
    login_server: String,
    auth_key: Option<Zeroizing<String>>,
    hostname: String,
    state_path: PathBuf,
    settings: OverlaySettings,
    daemon: Mutex<Option<Daemon>>,
    egress: RwLock<Option<SocketAddr>>,
}

impl OverlayConnector {
    /// Create a connector; nothing runs until [`ClusterConnector::start`]
    pub fn new(
        cluster_id: impl Into<String>,
        credentials: &OverlayCredentials,
        state_path: PathBuf,
        settings: OverlaySettings,
    ) -> Self {
        let cluster_id = cluster_id.into();
        let hostname = device_hostname(&credentials.hostname_prefix, &cluster_id, &local_hostname());
        Self {
            login_server: credentials.login_server.clone(),
            auth_key: credentials.auth_key.clone(),
            hostname,
            state_path: credentials.state_dir.clone().unwrap_or(state_path),
            settings,
            cluster_id,
            daemon: Mutex::new(None),
            egress: RwLock::new(None),
        }
    }

    fn details(&self) -> HealthDetails {
        HealthDetails {
            cluster_id: self.cluster_id.clone(),
            state_dir: Some(self.state_path.display().to_string()),
            login_server: Some(self.login_server.clone()),
            ..Default::default()
        }
    }

    fn cli(&self, state: &StateDir) -> Command {
        let mut cmd = Command::new(&self.settings.cli_bin);
        cmd.arg(format!("--socket={}", state.socket_path().display()))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn spawn_daemon(&self, state: &StateDir, egress: SocketAddr) -> Result<Child, LaunchError> {
        let mut child = Command::new(&self.settings.daemon_bin)
            .arg("--tun=userspace-networking")
            .arg(format!("--statedir={}", state.path().display()))
            .arg(format!("--socket={}", state.socket_path().display()))
            .arg(format!("--outbound-http-proxy-listen={}", egress))
            .arg("--port=0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LaunchError::Fatal(ConnectorError::setup(
                    &self.cluster_id,
                    format!("failed to spawn {}: {}", self.settings.daemon_bin.display(), e),
                ))
            })?;

        let socket = state.socket_path();
        let deadline = tokio::time::Instant::now() + self.settings.start_timeout;
        let mut settled = false;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(LaunchError::Exited(status.to_string()));
            }
            // One more poll after the egress answers, in case that was
            // someone else on the port and the daemon is about to exit
            if settled {
                return Ok(child);
            }
            settled = socket.exists() && TcpStream::connect(egress).await.is_ok();
            if !settled && tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(LaunchError::Fatal(ConnectorError::unreachable(
                    &self.cluster_id,
                    "tailscaled control socket or egress proxy never appeared",
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn login(&self, state: &StateDir) -> Result<(), ConnectorError> {
        let mut cmd = self.cli(state);
        cmd.arg("up")
            .arg(format!("--login-server={}", self.login_server))
            .arg(format!("--hostname={}", self.hostname))
            .arg("--accept-dns=false")
            .arg(format!("--timeout={}s", self.settings.start_timeout.as_secs().max(1)));

        // The key goes through a short-lived owner-only file, not argv
        let key_file = state.path().join("authkey");
        if let Some(key) = &self.auth_key {
            write_secret(&key_file, key).map_err(|e| {
                ConnectorError::setup(&self.cluster_id, format!("failed to stage auth key: {}", e))
            })?;
            cmd.arg(format!("--auth-key=file:{}", key_file.display()));
        }

        let output = tokio::time::timeout(
            self.settings.start_timeout + Duration::from_secs(5),
            cmd.output(),
        )
        .await;
        let _ = std::fs::remove_file(&key_file);

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ConnectorError::setup(
                    &self.cluster_id,
                    format!("failed to run {}: {}", self.settings.cli_bin.display(), e),
                ))
            }
            Err(_) => {
                return Err(ConnectorError::unreachable(
                    &self.cluster_id,
                    "tailscale up timed out",
                ))
            }
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_login_failure(&self.cluster_id, stderr.trim()))
    }

    async fn status(&self, state: &StateDir) -> Result<TailscaleStatus, String> {
        let mut cmd = self.cli(state);
        cmd.args(["status", "--json"]);
        let output = tokio::time::timeout(STATUS_TIMEOUT, cmd.output())
            .await
            .map_err(|_| "status timed out".to_string())?
            .map_err(|e| e.to_string())?;
        serde_json::from_slice(&output.stdout).map_err(|e| format!("invalid status JSON: {}", e))
    }

    async fn wait_running(&self, state: &StateDir) -> Result<(), ConnectorError> {
        let deadline = tokio::time::Instant::now() + self.settings.start_timeout;
        let mut last = String::from("no status yet");
        loop {
            match self.status(state).await {
                Ok(status) if status.backend_state == "Running" && status.self_ip().is_some() => {
                    return Ok(())
                }
                Ok(status) if status.backend_state == "NeedsLogin" => {
                    return Err(ConnectorError::auth(&self.cluster_id, "control plane requires login"))
                }
                Ok(status) => last = format!("backend state {}", status.backend_state),
                Err(e) => last = e,
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConnectorError::unreachable(
                    &self.cluster_id,
                    format!("overlay not running after {:?}: {}", self.settings.start_timeout, last),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ClusterConnector for OverlayConnector {
    #[instrument(skip(self), fields(cluster = %self.cluster_id))]
    async fn start(&self) -> Result<(), ConnectorError> {
        let mut daemon = self.daemon.lock().await;
        if daemon.is_some() {
            return Ok(());
        }

        let state = StateDir::prepare(&self.state_path).map_err(|e| {
            ConnectorError::setup(&self.cluster_id, format!("state directory: {}", e))
        })?;
        let lock = state.lock().map_err(|e| match e {
            LockError::Held(pid) => ConnectorError::AlreadyStarted {
                cluster: self.cluster_id.clone(),
                holder: pid,
            },
            LockError::Io(e) => ConnectorError::setup(&self.cluster_id, e.to_string()),
        })?;

        if self.auth_key.is_none() && !state.has_identity() {
            return Err(ConnectorError::auth(
                &self.cluster_id,
                "auth key required for first start",
            ));
        }

        let state_ref = &state;
        let (mut child, egress) = on_free_port(&self.cluster_id, EGRESS_ATTEMPTS, move |egress| {
            self.spawn_daemon(state_ref, egress)
        })
        .await?;

        let joined = match self.login(&state).await {
            Ok(()) => self.wait_running(&state).await,
            Err(e) => Err(e),
        };
        if let Err(e) = joined {
            let _ = child.kill().await;
            return Err(e);
        }

        *self.egress.write().await = Some(egress);
        *daemon = Some(Daemon { child, _lock: lock });
        info!(hostname = %self.hostname, egress = %egress, "Overlay connector started");
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<BoxedIo, ConnectorError> {
        let egress = (*self.egress.read().await).ok_or_else(|| ConnectorError::NotStarted {
            cluster: self.cluster_id.clone(),
        })?;
        let timeout = self.settings.dial_timeout;
        match tokio::time::timeout(timeout, connect_via(&self.cluster_id, egress, addr, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::DialTimeout {
                cluster: self.cluster_id.clone(),
                addr: addr.to_string(),
                timeout,
            }),
        }
    }

    async fn health(&self) -> ConnectorHealth {
        if self.egress.read().await.is_none() {
            return ConnectorHealth::new(HealthState::Stopped, self.details());
        }
        let state = StateDir::prepare(&self.state_path);
        let status = match state {
            Ok(state) => self.status(&state).await,
            Err(e) => Err(e.to_string()),
        };
        match status {
            Ok(status) => status.health(self.details()),
            Err(e) => ConnectorHealth::new(HealthState::Degraded, self.details()).with_message(e),
        }
    }

    async fn stop(&self) -> Result<(), ConnectorError> {
        *self.egress.write().await = None;
        let Some(mut daemon) = self.daemon.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = daemon.child.kill().await {
            warn!(cluster = %self.cluster_id, error = %e, "Failed to kill tailscaled");
        }
        debug!(cluster = %self.cluster_id, "Overlay connector stopped");
        Ok(())
    }

    fn state_dir(&self) -> Option<PathBuf> {
        Some(self.state_path.clone())
    }
}

/// Open a tunnel to `addr` through the daemon's HTTP CONNECT egress proxy
async fn connect_via(
    cluster_id: &str,
    egress: SocketAddr,
    addr: &str,
    timeout: Duration,
) -> Result<BoxedIo, ConnectorError> {
    let tcp: TcpStream = dial_tcp(cluster_id, &egress.to_string(), timeout).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
        .await
        .map_err(|e| ConnectorError::no_route(cluster_id, addr, format!("egress handshake: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Egress connection ended");
        }
    });

    let request = Request::builder()
        .method(Method::CONNECT)
        .uri(addr)
        .header(header::HOST, addr)
        .body(Empty::<Bytes>::new())
        .map_err(|e| ConnectorError::no_route(cluster_id, addr, e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ConnectorError::no_route(cluster_id, addr, e.to_string()))?;
    if !response.status().is_success() {
        return Err(ConnectorError::no_route(
            cluster_id,
            addr,
            format!("egress proxy answered {}", response.status()),
        ));
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|e| ConnectorError::no_route(cluster_id, addr, e.to_string()))?;
    Ok(Box::new(TokioIo::new(upgraded)))
}

fn classify_login_failure(cluster_id: &str, stderr: &str) -> ConnectorError {
    let lower = stderr.to_ascii_lowercase();
    let auth_markers = ["invalid key", "auth key", "authkey", "unauthorized", "expired", "not valid"];
    if auth_markers.iter().any(|m| lower.contains(m)) {
        ConnectorError::auth(cluster_id, stderr)
    } else {
        ConnectorError::unreachable(cluster_id, stderr)
    }
}

/// `<prefix>-<cluster>-<host>`, as one DNS label
fn device_hostname(prefix: &str, cluster_id: &str, host: &str) -> String {
    sanitize(&format!("{}-{}-{}", prefix, cluster_id, host))
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "node".to_string())
}

fn reserve_loopback_port() -> std::io::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    listener.local_addr()
}

/// Why a daemon launch did not come up
#[derive(Debug)]
enum LaunchError {
    /// Exited before it was ready, typically because its egress port was
    /// taken after we reserved it
    Exited(String),
    /// Not worth retrying
    Fatal(ConnectorError),
}

/// Run `launch` on freshly reserved loopback ports until one sticks.
///
/// A reserved port is released again before the daemon binds it, so
/// another process can take it in between; a launch that reports
/// [`LaunchError::Exited`] is retried on a new port, up to `attempts` times.
async fn on_free_port<T, F, Fut>(
    cluster_id: &str,
    attempts: usize,
    mut launch: F,
) -> Result<(T, SocketAddr), ConnectorError>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = Result<T, LaunchError>>,
{
    let mut last = String::from("no launch attempted");
    for attempt in 1..=attempts {
        let port = reserve_loopback_port()
            .map_err(|e| ConnectorError::setup(cluster_id, e.to_string()))?;
        match launch(port).await {
            Ok(value) => return Ok((value, port)),
            Err(LaunchError::Exited(status)) => {
                warn!(cluster = %cluster_id, attempt, %port, %status, "tailscaled exited early, retrying on a new egress port");
                last = status;
            }
            Err(LaunchError::Fatal(e)) => return Err(e),
        }
    }
    Err(ConnectorError::setup(
        cluster_id,
        format!("tailscaled exited early ({})", last),
    ))
}

fn write_secret(path: &std::path::Path, secret: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(secret.as_bytes())
}

/// Subset of `tailscale status --json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleStatus {
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<PeerStatus>,
    #[serde(default)]
    peer: Option<HashMap<String, PeerStatus>>,
}

#[derive(Debug, Deserialize)]
struct PeerStatus {
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Option<Vec<String>>,
    #[serde(rename = "DNSName", default)]
    dns_name: String,
    #[serde(rename = "Online", default)]
    online: bool,
}

impl TailscaleStatus {
    fn self_ip(&self) -> Option<&str> {
        self.self_node
            .as_ref()
            .and_then(|n| n.tailscale_ips.as_ref())
            .and_then(|ips| ips.first())
            .map(String::as_str)
    }

    fn health(&self, mut details: HealthDetails) -> ConnectorHealth {
        details.ip = self.self_ip().map(str::to_string);
        details.dns_name = self
            .self_node
            .as_ref()
            .map(|n| n.dns_name.trim_end_matches('.').to_string())
            .filter(|n| !n.is_empty());
        details.online_peers = self
            .peer
            .as_ref()
            .map(|peers| peers.values().filter(|p| p.online).count())
            .unwrap_or(0);

        let state = match self.backend_state.as_str() {
            "Running" if details.ip.is_some() => HealthState::Ok,
            "Starting" | "NoState" => HealthState::Starting,
            _ => HealthState::Degraded,
        };
        let health = ConnectorHealth::new(state, details);
        if state == HealthState::Ok {
            health
        } else {
            health.with_message(format!("backend state {}", self.backend_state))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn credentials(auth_key: Option<&str>) -> OverlayCredentials {
        OverlayCredentials {
            login_server: "https://hs.example.com".to_string(),
            auth_key: auth_key.map(|k| Zeroizing::new(k.to_string())),
            state_dir: None,
            hostname_prefix: "corridor".to_string(),
        }
    }

    fn connector(state_path: PathBuf, auth_key: Option<&str>) -> OverlayConnector {
        OverlayConnector::new(
            "c1",
            &credentials(auth_key),
            state_path,
            OverlaySettings {
                daemon_bin: PathBuf::from("/nonexistent/tailscaled"),
                cli_bin: PathBuf::from("/nonexistent/tailscale"),
                start_timeout: Duration::from_millis(200),
                dial_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn early_exit_is_retried_on_a_new_port() {
        let mut tried = Vec::new();
        let (launches, port) = on_free_port("c1", EGRESS_ATTEMPTS, |port| {
            tried.push(port);
            let n = tried.len();
            async move {
                if n == 1 {
                    Err(LaunchError::Exited("exit status: 1".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(launches, 2);
        assert_eq!(port, tried[1]);
        assert!(port.ip().is_loopback());
    }

    #[tokio::test]
    async fn egress_retries_are_bounded() {
        let mut launches = 0;
        let err = on_free_port("c1", EGRESS_ATTEMPTS, |_| {
            launches += 1;
            async { Err::<(), _>(LaunchError::Exited("exit status: 1".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(launches, EGRESS_ATTEMPTS);
        assert!(err.to_string().contains("exited early"), "{}", err);
    }

    #[tokio::test]
    async fn fatal_launch_errors_are_not_retried() {
        let mut launches = 0;
        let err = on_free_port("c1", EGRESS_ATTEMPTS, |_| {
            launches += 1;
            async { Err::<(), _>(LaunchError::Fatal(ConnectorError::setup("c1", "no binary"))) }
        })
        .await
        .unwrap_err();
        assert_eq!(launches, 1);
        assert!(err.to_string().contains("no binary"), "{}", err);
    }

    #[test]
    fn hostname_joins_prefix_cluster_and_host() {
        assert_eq!(device_hostname("corridor", "Prod_1", "web.local"), "corridor-prod-1-web-local");
    }

    #[test]
    fn login_failures_are_classified() {
        assert!(matches!(
            classify_login_failure("c1", "backend error: invalid key: unable to validate API key"),
            ConnectorError::Auth { .. }
        ));
        assert!(matches!(
            classify_login_failure("c1", "dial tcp: connection refused"),
            ConnectorError::ControlPlaneUnreachable { .. }
        ));
    }

    #[test]
    fn status_json_maps_to_health() {
        let status: TailscaleStatus = serde_json::from_str(
            r#"{
                "BackendState": "Running",
                "Self": {"TailscaleIPs": ["100.64.0.7", "fd7a::7"], "DNSName": "corridor-c1-node.tail.net.", "Online": true},
                "Peer": {
                    "a": {"TailscaleIPs": ["100.64.0.8"], "DNSName": "n1.", "Online": true},
                    "b": {"TailscaleIPs": ["100.64.0.9"], "DNSName": "n2.", "Online": false}
                }
            }"#,
        )
        .unwrap();
        let health = status.health(HealthDetails::default());
        assert_eq!(health.state, HealthState::Ok);
        assert_eq!(health.details.ip.as_deref(), Some("100.64.0.7"));
        assert_eq!(health.details.dns_name.as_deref(), Some("corridor-c1-node.tail.net"));
        assert_eq!(health.details.online_peers, 1);
    }

    #[test]
    fn status_without_ip_is_degraded() {
        let status: TailscaleStatus =
            serde_json::from_str(r#"{"BackendState": "NeedsMachineAuth", "Self": null, "Peer": null}"#).unwrap();
        let health = status.health(HealthDetails::default());
        assert_eq!(health.state, HealthState::Degraded);
        assert!(health.message.unwrap().contains("NeedsMachineAuth"));
    }

    #[tokio::test]
    async fn first_start_without_key_or_state_is_auth_error() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = connector(tmp.path().join("cluster-c1"), None);
        let err = connector.start().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Auth { .. }));
        // The lock is released on failure
        assert!(!tmp.path().join("cluster-c1").join("corridor.lock").exists());
    }

    #[tokio::test]
    async fn missing_daemon_binary_is_setup_error() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = connector(tmp.path().join("cluster-c1"), Some("tskey-test"));
        let err = connector.start().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Setup { .. }));
    }

    #[tokio::test]
    async fn dial_and_health_before_start() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = connector(tmp.path().join("cluster-c1"), Some("k"));
        let err = connector.dial("10.0.0.1:80").await.err().unwrap();
        assert!(matches!(err, ConnectorError::NotStarted { .. }));
        let health = connector.health().await;
        assert_eq!(health.state, HealthState::Stopped);
        assert_eq!(health.details.login_server.as_deref(), Some("https://hs.example.com"));
        connector.stop().await.unwrap();
    }

    /// Minimal CONNECT proxy: answers with `status_line`, then echoes
    async fn spawn_connect_proxy(status_line: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                socket.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            assert!(head.starts_with(b"CONNECT 10.1.2.3:8080 HTTP/1.1"));
            socket.write_all(status_line.as_bytes()).await.unwrap();
            let mut buf = [0u8; 4];
            if socket.read_exact(&mut buf).await.is_ok() {
                socket.write_all(&buf).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn dial_tunnels_through_egress_proxy() {
        let egress = spawn_connect_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let mut io = connect_via("c1", egress, "10.1.2.3:8080", Duration::from_secs(1))
            .await
            .ok()
            .unwrap();
        io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn refused_connect_is_no_route() {
        let egress =
            spawn_connect_proxy("HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n").await;
        let err = connect_via("c1", egress, "10.1.2.3:8080", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectorError::NoRoute { .. }));
    }
}
