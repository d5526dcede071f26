//! Process configuration file
//!
//! A single YAML document with server settings and the cluster credential
//! store:
//!
//! ```yaml
//! server:
//!   listen: 0.0.0.0:8443
//!   state_dir: /var/lib/corridor
//!   default_cluster: c1
//!   tls:
//!     cert: /etc/corridor/tls.crt
//!     key: /etc/corridor/tls.key
//! clusters:
//!   c1:
//!     kubeconfig_path: c1.kubeconfig
//!     overlay:
//!       login_server: https://login.example.com
//!       auth_key_env: CORRIDOR_C1_AUTH_KEY
//!     policy:
//!       use_port_forward: true
//!     overrides:
//!       ws1: 10.0.0.5:8080
//! ```
//!
//! Relative paths are resolved against the directory holding the file.
//! Kubeconfig files and auth key variables are read when a cluster is first
//! used, not at load time.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use zeroize::Zeroizing;

use corridor_cluster::IdentitySource;
use corridor_common::{ClusterIdentity, ClusterPolicy, ConfigError, OverlayCredentials};

/// Default listen address
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8443";

/// Default overlay device hostname prefix
pub const DEFAULT_HOSTNAME_PREFIX: &str = "corridor";

/// Errors loading the configuration file
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that was parsed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_yaml::Error,
    },

    /// A cluster entry is inconsistent
    #[error("cluster {cluster}: {message}")]
    Invalid {
        /// Offending cluster ID
        cluster: String,
        /// What is wrong
        message: String,
    },
}

impl ConfigFileError {
    fn invalid(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invalid {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and engine settings
    pub server: ServerSection,
    /// Cluster credential store keyed by cluster ID
    pub clusters: HashMap<String, ClusterConfig>,
}

/// Listener and engine settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind
    pub listen: Option<SocketAddr>,
    /// Parent directory for overlay state
    pub state_dir: Option<PathBuf>,
    /// Cluster served under `/proxy`
    pub default_cluster: Option<String>,
    /// Request body cap in bytes
    pub max_body_bytes: Option<usize>,
    /// HTTPS certificate and key
    pub tls: Option<TlsSection>,
}

/// PEM paths for HTTPS
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    /// Certificate chain
    pub cert: PathBuf,
    /// Private key
    pub key: PathBuf,
}

/// One cluster's credentials and policy
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Inline kubeconfig YAML
    #[serde(deserialize_with = "secret")]
    pub kubeconfig: Option<Zeroizing<String>>,
    /// Path to a kubeconfig file
    pub kubeconfig_path: Option<PathBuf>,
    /// Overlay network credentials; direct networking when absent
    pub overlay: Option<OverlayConfig>,
    /// Routing policy
    pub policy: ClusterPolicy,
    /// Workload address overrides (`host[:port]`) keyed by workload ID
    pub overrides: HashMap<String, String>,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("kubeconfig", &self.kubeconfig.as_ref().map(|_| "<redacted>"))
            .field("kubeconfig_path", &self.kubeconfig_path)
            .field("overlay", &self.overlay)
            .field("policy", &self.policy)
            .field("overrides", &self.overrides)
            .finish()
    }
}

/// Overlay credentials as written in the file
#[derive(Clone, Deserialize)]
pub struct OverlayConfig {
    /// Control-plane URL
    pub login_server: String,
    /// Inline auth key
    #[serde(default, deserialize_with = "secret")]
    pub auth_key: Option<Zeroizing<String>>,
    /// Environment variable holding the auth key
    #[serde(default)]
    pub auth_key_env: Option<String>,
    /// Explicit state directory
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Device hostname prefix
    #[serde(default = "default_hostname_prefix")]
    pub hostname_prefix: String,
}

impl fmt::Debug for OverlayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayConfig")
            .field("login_server", &self.login_server)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("auth_key_env", &self.auth_key_env)
            .field("state_dir", &self.state_dir)
            .field("hostname_prefix", &self.hostname_prefix)
            .finish()
    }
}

fn default_hostname_prefix() -> String {
    DEFAULT_HOSTNAME_PREFIX.to_string()
}

fn secret<'de, D>(deserializer: D) -> Result<Option<Zeroizing<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(Zeroizing::new))
}

impl Config {
    /// Load and validate `path`
    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&data).map_err(|source| ConfigFileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check every cluster names exactly one kubeconfig source
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        for (id, cluster) in &self.clusters {
            match (&cluster.kubeconfig, &cluster.kubeconfig_path) {
                (Some(_), Some(_)) => {
                    return Err(ConfigFileError::invalid(
                        id,
                        "kubeconfig and kubeconfig_path are mutually exclusive",
                    ))
                }
                (None, None) => {
                    return Err(ConfigFileError::invalid(
                        id,
                        "one of kubeconfig or kubeconfig_path is required",
                    ))
                }
                _ => {}
            }
            if let Some(overlay) = &cluster.overlay {
                if overlay.login_server.trim().is_empty() {
                    return Err(ConfigFileError::invalid(id, "overlay.login_server is empty"));
                }
                if overlay.auth_key.is_some() && overlay.auth_key_env.is_some() {
                    return Err(ConfigFileError::invalid(
                        id,
                        "overlay.auth_key and overlay.auth_key_env are mutually exclusive",
                    ));
                }
            }
        }
        if let Some(default) = &self.server.default_cluster {
            if !self.clusters.contains_key(default) {
                return Err(ConfigFileError::invalid(default, "default cluster is not configured"));
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(tls) = self.server.tls.as_mut() {
            resolve(&mut tls.cert);
            resolve(&mut tls.key);
        }
        if let Some(dir) = self.server.state_dir.as_mut() {
            resolve(dir);
        }
        for cluster in self.clusters.values_mut() {
            if let Some(path) = cluster.kubeconfig_path.as_mut() {
                resolve(path);
            }
            if let Some(dir) = cluster.overlay.as_mut().and_then(|o| o.state_dir.as_mut()) {
                resolve(dir);
            }
        }
    }
}

/// [`IdentitySource`] over the file's `clusters` map
pub struct FileIdentitySource {
    clusters: HashMap<String, ClusterConfig>,
}

impl FileIdentitySource {
    /// Serve identities from `clusters`
    pub fn new(clusters: HashMap<String, ClusterConfig>) -> Self {
        Self { clusters }
    }

    fn kubeconfig(&self, id: &str, cluster: &ClusterConfig) -> Result<String, ConfigError> {
        if let Some(inline) = &cluster.kubeconfig {
            return Ok(inline.to_string());
        }
        let path = cluster
            .kubeconfig_path
            .as_ref()
            .ok_or_else(|| ConfigError::missing(id, "no kubeconfig configured"))?;
        std::fs::read_to_string(path).map_err(|e| {
            ConfigError::kubeconfig(id, format!("failed to read {}: {}", path.display(), e))
        })
    }
}

fn overlay_credentials(id: &str, overlay: &OverlayConfig) -> Result<OverlayCredentials, ConfigError> {
    let auth_key = match (&overlay.auth_key, &overlay.auth_key_env) {
        (Some(key), _) => Some(key.clone()),
        (None, Some(var)) => match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Some(Zeroizing::new(value)),
            Ok(_) => None,
            Err(std::env::VarError::NotPresent) => None,
            Err(e) => {
                return Err(ConfigError::missing(
                    id,
                    format!("auth key variable {}: {}", var, e),
                ))
            }
        },
        (None, None) => None,
    };
    Ok(OverlayCredentials {
        login_server: overlay.login_server.trim().to_string(),
        auth_key,
        state_dir: overlay.state_dir.clone(),
        hostname_prefix: overlay.hostname_prefix.clone(),
    })
}

#[async_trait]
impl IdentitySource for FileIdentitySource {
    async fn load(&self, cluster_id: &str) -> Result<ClusterIdentity, ConfigError> {
        let cluster = self
            .clusters
            .get(cluster_id)
            .ok_or_else(|| ConfigError::UnknownCluster(cluster_id.to_string()))?;
        let kubeconfig = Zeroizing::new(self.kubeconfig(cluster_id, cluster)?);

        let mut identity = ClusterIdentity::new(cluster_id, kubeconfig.as_str())
            .with_policy(cluster.policy.clone());
        identity.overrides = cluster.overrides.clone();
        if let Some(overlay) = &cluster.overlay {
            identity = identity.with_overlay(overlay_credentials(cluster_id, overlay)?);
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"apiVersion: v1
kind: Config
clusters:
- name: c
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: c
  context:
    cluster: c
    user: u
current-context: c
users:
- name: u
  user:
    token: abc
"#;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("corridor.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_server_and_clusters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c1.kubeconfig"), KUBECONFIG).unwrap();
        let path = write_config(
            dir.path(),
            r#"
server:
  listen: 127.0.0.1:9000
  default_cluster: c1
  max_body_bytes: 2048
  tls:
    cert: tls.crt
    key: /abs/tls.key
clusters:
  c1:
    kubeconfig_path: c1.kubeconfig
    policy:
      use_port_forward: true
      namespace: tools
    overrides:
      ws1: 10.0.0.5:8080
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(config.server.max_body_bytes, Some(2048));
        let tls = config.server.tls.unwrap();
        assert_eq!(tls.cert, dir.path().join("tls.crt"));
        assert_eq!(tls.key, PathBuf::from("/abs/tls.key"));

        let c1 = &config.clusters["c1"];
        assert_eq!(c1.kubeconfig_path, Some(dir.path().join("c1.kubeconfig")));
        assert!(c1.policy.use_port_forward);
        assert_eq!(c1.policy.namespace(), "tools");
        assert!(!c1.policy.disable_api_proxy);
        assert_eq!(c1.overrides["ws1"], "10.0.0.5:8080");
    }

    #[test]
    fn empty_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{}\n");
        let config = Config::load(&path).unwrap();
        assert!(config.clusters.is_empty());
        assert!(config.server.listen.is_none());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigFileError::Read { .. }));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "clusters: [not, a, map]\n");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigFileError::Parse { .. }));
    }

    #[test]
    fn cluster_needs_exactly_one_kubeconfig_source() {
        let dir = tempfile::tempdir().unwrap();
        let none = write_config(dir.path(), "clusters:\n  c1:\n    overrides: {}\n");
        let err = Config::load(&none).unwrap_err();
        assert!(err.to_string().contains("required"), "{err}");

        let both = write_config(
            dir.path(),
            "clusters:\n  c1:\n    kubeconfig: x\n    kubeconfig_path: y\n",
        );
        let err = Config::load(&both).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"), "{err}");
    }

    #[test]
    fn default_cluster_must_be_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "server:\n  default_cluster: ghost\nclusters:\n  c1:\n    kubeconfig: x\n",
        );
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigFileError::Invalid { ref cluster, .. } if cluster == "ghost"));
    }

    #[test]
    fn overlay_auth_key_is_redacted_in_debug() {
        let config: Config = serde_yaml::from_str(
            "clusters:\n  c1:\n    kubeconfig: x\n    overlay:\n      login_server: https://ls\n      auth_key: tskey-secret\n",
        )
        .unwrap();
        let overlay = config.clusters["c1"].overlay.clone().unwrap();
        assert_eq!(overlay.hostname_prefix, DEFAULT_HOSTNAME_PREFIX);
        let printed = format!("{:?}", overlay);
        assert!(!printed.contains("tskey-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[tokio::test]
    async fn source_reads_kubeconfig_file_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let kubeconfig = dir.path().join("c1.kubeconfig");
        std::fs::write(&kubeconfig, KUBECONFIG).unwrap();
        let cluster = ClusterConfig {
            kubeconfig_path: Some(kubeconfig),
            overrides: HashMap::from([("ws1".to_string(), "10.0.0.5".to_string())]),
            ..Default::default()
        };
        let source = FileIdentitySource::new(HashMap::from([("c1".to_string(), cluster)]));

        let identity = source.load("c1").await.unwrap();
        assert_eq!(identity.id, "c1");
        assert_eq!(identity.kubeconfig.as_str(), KUBECONFIG);
        assert!(identity.overlay.is_none());
        assert_eq!(identity.overrides["ws1"], "10.0.0.5");
    }

    #[tokio::test]
    async fn unknown_cluster_is_reported() {
        let source = FileIdentitySource::new(HashMap::new());
        let err = source.load("ghost").await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCluster(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn unreadable_kubeconfig_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = ClusterConfig {
            kubeconfig_path: Some(dir.path().join("missing")),
            ..Default::default()
        };
        let source = FileIdentitySource::new(HashMap::from([("c1".to_string(), cluster)]));
        let err = source.load("c1").await.unwrap_err();
        assert!(matches!(err, ConfigError::Kubeconfig { .. }));
    }

    #[tokio::test]
    async fn overlay_auth_key_comes_from_environment() {
        let var = "CORRIDOR_TEST_AUTH_KEY_FROM_ENV";
        std::env::set_var(var, "tskey-from-env");
        let cluster = ClusterConfig {
            kubeconfig: Some(Zeroizing::new(KUBECONFIG.to_string())),
            overlay: Some(OverlayConfig {
                login_server: " https://ls.example.com ".to_string(),
                auth_key: None,
                auth_key_env: Some(var.to_string()),
                state_dir: None,
                hostname_prefix: "edge".to_string(),
            }),
            ..Default::default()
        };
        let source = FileIdentitySource::new(HashMap::from([("c1".to_string(), cluster)]));

        let identity = source.load("c1").await.unwrap();
        std::env::remove_var(var);
        let overlay = identity.overlay.unwrap();
        assert_eq!(overlay.login_server, "https://ls.example.com");
        assert_eq!(overlay.auth_key.as_deref().map(String::as_str), Some("tskey-from-env"));
        assert_eq!(overlay.hostname_prefix, "edge");
    }

    #[tokio::test]
    async fn unset_auth_key_variable_means_no_key() {
        let cluster = ClusterConfig {
            kubeconfig: Some(Zeroizing::new(KUBECONFIG.to_string())),
            overlay: Some(OverlayConfig {
                login_server: "https://ls".to_string(),
                auth_key: None,
                auth_key_env: Some("CORRIDOR_TEST_AUTH_KEY_NEVER_SET".to_string()),
                state_dir: None,
                hostname_prefix: DEFAULT_HOSTNAME_PREFIX.to_string(),
            }),
            ..Default::default()
        };
        let source = FileIdentitySource::new(HashMap::from([("c1".to_string(), cluster)]));
        let identity = source.load("c1").await.unwrap();
        assert!(identity.overlay.unwrap().auth_key.is_none());
    }
}
