//! Path and query helpers for the proxy addressing forms
//!
//! Single source of truth for how mount prefixes, subpaths and control
//! parameters are read from a request URL.

use std::borrow::Cow;

/// Query parameters consumed by the proxy and never forwarded upstream
pub const CONTROL_PARAMS: [&str; 3] = ["to", "path", "scheme"];

const PROXY_MOUNT: &str = "/proxy";
const CLUSTER_MOUNT: &str = "/api/cluster/";

/// Split a request path into the proxy mount and the remainder after it.
///
/// The mount is `/proxy` or `/api/cluster/{cluster}/proxy`.
///
/// # Examples
///
/// ```
/// use corridor_proxy::routing::split_mount;
///
/// assert_eq!(split_mount("/proxy/server/ws1/x"), Some(("/proxy", "/server/ws1/x")));
/// assert_eq!(
///     split_mount("/api/cluster/c1/proxy/server/ws1"),
///     Some(("/api/cluster/c1/proxy", "/server/ws1"))
/// );
/// assert_eq!(split_mount("/proxy"), Some(("/proxy", "")));
/// assert_eq!(split_mount("/proxyfoo"), None);
/// ```
pub fn split_mount(path: &str) -> Option<(&str, &str)> {
    let mount_len = if let Some(rest) = path.strip_prefix(CLUSTER_MOUNT) {
        let cluster_len = rest.find('/').filter(|i| *i > 0)?;
        CLUSTER_MOUNT.len() + cluster_len + PROXY_MOUNT.len()
    } else {
        PROXY_MOUNT.len()
    };
    let mount = path.get(..mount_len)?;
    let rest = &path[mount_len..];
    if !mount.ends_with(PROXY_MOUNT) || !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }
    Some((mount, rest))
}

/// Make a subpath absolute; empty means `/`.
///
/// # Examples
///
/// ```
/// use corridor_proxy::routing::normalize_subpath;
///
/// assert_eq!(normalize_subpath(""), "/");
/// assert_eq!(normalize_subpath("terminal"), "/terminal");
/// assert_eq!(normalize_subpath("/a/b"), "/a/b");
/// ```
pub fn normalize_subpath(path: &str) -> Cow<'_, str> {
    if path.starts_with('/') {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(format!("/{}", path))
    }
}

/// Read and percent-decode one query parameter
///
/// # Examples
///
/// ```
/// use corridor_proxy::routing::query_param;
///
/// assert_eq!(query_param("to=svc%3A8080&x=1", "to").as_deref(), Some("svc:8080"));
/// assert_eq!(query_param("a=1", "to"), None);
/// ```
pub fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| {
            let value = value.replace('+', " ");
            urlencoding::decode(&value)
                .map(Cow::into_owned)
                .unwrap_or(value)
        })
}

/// Drop the proxy's control parameters, keeping everything else verbatim.
///
/// Returns None when nothing is left.
///
/// # Examples
///
/// ```
/// use corridor_proxy::routing::strip_control_params;
///
/// assert_eq!(
///     strip_control_params("to=svc:80&folder=%2Fhome&path=/").as_deref(),
///     Some("folder=%2Fhome")
/// );
/// assert_eq!(strip_control_params("to=svc:80&scheme=http"), None);
/// ```
pub fn strip_control_params(query: &str) -> Option<String> {
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            !CONTROL_PARAMS.contains(&key)
        })
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}

/// Percent-decode one path segment, leaving it unchanged when invalid
pub fn unescape_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| segment.to_string())
}
