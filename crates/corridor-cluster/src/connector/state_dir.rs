//! Per-cluster overlay state directories
//!
//! Layout under the state root:
//!
//! ```text
//! <root>/cluster-<slug>/          0700
//!     tailscaled.state            persisted node identity
//!     tailscaled.sock             local control socket
//!     corridor.lock               pid of the owning process
//! ```
//!
//! One directory per cluster ID; never shared. Removing a cluster deletes its
//! directory wholesale.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use corridor_common::names::cluster_slug;
use thiserror::Error;
use tracing::{debug, warn};

const LOCK_FILE: &str = "corridor.lock";
const STATE_FILE: &str = "tailscaled.state";
const SOCKET_FILE: &str = "tailscaled.sock";

/// Root under which each cluster gets its own directory
#[derive(Debug, Clone)]
pub struct StateRoot {
    root: PathBuf,
}

impl StateRoot {
    /// Use `root` as the parent of all cluster directories
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root path
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory for one cluster.
    ///
    /// # Examples
    ///
    /// ```
    /// use corridor_cluster::connector::StateRoot;
    ///
    /// let root = StateRoot::new("/var/lib/corridor");
    /// assert_eq!(
    ///     root.cluster_dir("Prod_EU").to_str(),
    ///     Some("/var/lib/corridor/cluster-prod-eu")
    /// );
    /// ```
    pub fn cluster_dir(&self, cluster_id: &str) -> PathBuf {
        self.root.join(format!("cluster-{}", cluster_slug(cluster_id)))
    }
}

/// Why a state directory lock could not be taken
#[derive(Debug, Error)]
pub enum LockError {
    /// A live process already holds the lock
    #[error("state directory locked by pid {0}")]
    Held(u32),

    /// Filesystem error
    #[error("state directory lock failed: {0}")]
    Io(#[from] io::Error),
}

/// A prepared, permission-restricted cluster state directory
#[derive(Debug, Clone)]
pub struct StateDir {
    path: PathBuf,
}

impl StateDir {
    /// Create the directory if needed and restrict it to the owner
    pub fn prepare(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        restrict_permissions(&path)?;
        Ok(Self { path })
    }

    /// Refer to a directory without creating it
    pub fn existing(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Control socket path for the overlay daemon
    pub fn socket_path(&self) -> PathBuf {
        self.path.join(SOCKET_FILE)
    }

    /// Whether a node identity was persisted by an earlier run
    pub fn has_identity(&self) -> bool {
        self.path.join(STATE_FILE).is_file()
    }

    /// Take the exclusive lock for this directory.
    ///
    /// A lock file left by a process that no longer exists is taken over.
    pub fn lock(&self) -> Result<StateLock, LockError> {
        let lock_path = self.path.join(LOCK_FILE);
        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(StateLock { path: lock_path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&lock_path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if process_alive(pid) => return Err(LockError::Held(pid)),
                        _ => {
                            debug!(path = %lock_path.display(), "Removing stale state lock");
                            fs::remove_file(&lock_path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LockError::Io(io::Error::new(
            io::ErrorKind::WouldBlock,
            "lock file reappeared while taking it over",
        )))
    }

    /// Delete the directory and everything in it
    pub fn purge(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Held lock on a state directory; released on drop
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to release state lock");
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Liveness check via procfs. Where procfs is absent every holder looks
/// dead, so locks only protect within one process there.
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
