//! Proxy addressing forms
//!
//! Three ways to name an upstream, all under a proxy mount (`/proxy` or
//! `/api/cluster/{cluster}/proxy`):
//! - query: `{mount}?to=host:port&path=/sub&scheme=https`
//! - path: `{mount}/{host:port}/{sub}`
//! - workload: `{mount}/server/{id}/{sub}`, resolved per cluster
//!
//! [`parse_route`] turns a request path and query into a [`ProxyRoute`]; the
//! helpers in [`path`] are the single source of truth for the string rules.

mod path;

pub use path::{
    normalize_subpath, query_param, split_mount, strip_control_params, unescape_segment,
    CONTROL_PARAMS,
};

use corridor_common::net::{join_host_port, scheme_for_port, split_host_port};

use crate::error::{ProxyError, Result};

const WORKLOAD_SEGMENT: &str = "server/";

/// What the request addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// An explicit `host:port`
    Address {
        /// `http` or `https`
        scheme: String,
        /// Host name or IP
        host: String,
        /// Port, 1-65535
        port: u16,
    },
    /// A workload identifier to resolve in the cluster
    Workload {
        /// Identifier, percent-decoded
        id: String,
    },
}

/// A parsed proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    /// Addressed upstream
    pub target: Target,
    /// Path on the upstream, always starting with `/`
    pub subpath: String,
    /// Externally-visible prefix the upstream is mounted under
    pub prefix: String,
    /// Query string to forward, control parameters removed
    pub query: Option<String>,
}

impl ProxyRoute {
    /// Subpath plus forwarded query
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.subpath, query),
            None => self.subpath.clone(),
        }
    }
}

impl Target {
    /// `host:port` for address targets
    pub fn hostport(&self) -> Option<String> {
        match self {
            Target::Address { host, port, .. } => Some(join_host_port(host, *port)),
            Target::Workload { .. } => None,
        }
    }
}

/// Parse a raw request path and query into a route
pub fn parse_route(path: &str, query: Option<&str>) -> Result<ProxyRoute> {
    let (mount, rest) = split_mount(path)
        .ok_or_else(|| ProxyError::BadTarget(format!("{} is not a proxy path", path)))?;
    let query = query.unwrap_or("");
    let forwarded = strip_control_params(query);
    let scheme = query_param(query, "scheme").filter(|s| !s.is_empty());

    // Query form wins when `to` is given
    if let Some(to) = query_param(query, "to").filter(|t| !t.is_empty()) {
        let subpath = query_param(query, "path").unwrap_or_default();
        return Ok(ProxyRoute {
            target: address(&to, scheme.as_deref())?,
            subpath: normalize_subpath(&subpath).into_owned(),
            prefix: mount.to_string(),
            query: forwarded,
        });
    }

    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return Err(ProxyError::BadTarget("missing or invalid to/path".into()));
    }

    if let Some(tail) = rest.strip_prefix(WORKLOAD_SEGMENT) {
        let (raw_id, sub) = split_first_segment(tail);
        let id = unescape_segment(raw_id);
        if id.trim().is_empty() {
            return Err(ProxyError::BadTarget("missing workload id".into()));
        }
        // Decoded IDs become object names in API paths
        if id.contains('/') {
            return Err(ProxyError::BadTarget(format!(
                "workload id {:?} must not contain '/'",
                id
            )));
        }
        return Ok(ProxyRoute {
            target: Target::Workload { id },
            subpath: normalize_subpath(sub).into_owned(),
            prefix: format!("{}/{}{}", mount, WORKLOAD_SEGMENT, raw_id),
            query: forwarded,
        });
    }

    let (raw_to, sub) = split_first_segment(rest);
    Ok(ProxyRoute {
        target: address(&unescape_segment(raw_to), scheme.as_deref())?,
        subpath: normalize_subpath(sub).into_owned(),
        prefix: format!("{}/{}", mount, raw_to),
        query: forwarded,
    })
}

/// Validate `host:port` and settle the scheme
fn address(to: &str, scheme: Option<&str>) -> Result<Target> {
    let (host, port) = split_host_port(to).ok_or_else(|| {
        ProxyError::BadTarget(format!(
            "invalid to {:?}: need host:port with port 1-65535",
            to
        ))
    })?;
    let scheme = match scheme {
        Some(s @ ("http" | "https")) => s.to_string(),
        Some(other) => {
            return Err(ProxyError::BadTarget(format!("invalid scheme {:?}", other)))
        }
        None => scheme_for_port(port).to_string(),
    };
    Ok(Target::Address {
        scheme,
        host: host.to_string(),
        port,
    })
}

/// `"a/b/c"` → `("a", "/b/c")`; `"a"` → `("a", "")`
fn split_first_segment(path: &str) -> (&str, &str) {
    match path.find('/') {
        Some(i) => (&path[..i], &path[i..]),
        None => (path, ""),
    }
}
