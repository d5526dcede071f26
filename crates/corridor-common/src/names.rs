//! Name normalization for DNS labels and per-cluster state
//!
//! Workload identifiers arrive in whatever form users typed them. Before they
//! are used as Service names or DNS labels they go through [`sanitize`], which
//! is idempotent: feeding its output back in returns the same string.

/// Fallback label when a workload identifier sanitizes to nothing
pub const FALLBACK_WORKLOAD_NAME: &str = "workload";

/// Fallback label when a cluster identifier sanitizes to nothing
pub const FALLBACK_CLUSTER_NAME: &str = "default";

/// Maximum length of a DNS-1123 label
const MAX_LABEL_LEN: usize = 63;

/// Turn an arbitrary identifier into a DNS-1123 label.
///
/// Lowercases, maps whitespace, `_` and `.` to `-`, drops anything outside
/// `[a-z0-9-]`, collapses dash runs and trims dashes at both ends.
///
/// # Examples
///
/// ```
/// use corridor_common::names::sanitize;
///
/// assert_eq!(sanitize("My App!!"), "my-app");
/// assert_eq!(sanitize("__"), "workload");
/// assert_eq!(sanitize(&sanitize("a__b")), sanitize("a__b"));
/// ```
pub fn sanitize(input: &str) -> String {
    sanitize_or(input, FALLBACK_WORKLOAD_NAME)
}

/// Normalize a cluster ID for use as a directory or hostname component.
///
/// # Examples
///
/// ```
/// use corridor_common::names::cluster_slug;
///
/// assert_eq!(cluster_slug("Prod_EU.1"), "prod-eu-1");
/// assert_eq!(cluster_slug("!!!"), "default");
/// ```
pub fn cluster_slug(cluster_id: &str) -> String {
    sanitize_or(cluster_id, FALLBACK_CLUSTER_NAME)
}

fn sanitize_or(input: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.chars().flat_map(char::to_lowercase) {
        match ch {
            'a'..='z' | '0'..='9' => {
                if pending_dash && !out.is_empty() {
                    out.push('-');
                }
                pending_dash = false;
                out.push(ch);
            }
            '-' | '_' | '.' => pending_dash = true,
            c if c.is_whitespace() => pending_dash = true,
            _ => {}
        }
    }

    if out.len() > MAX_LABEL_LEN {
        out.truncate(MAX_LABEL_LEN);
        while out.ends_with('-') {
            out.pop();
        }
    }

    if out.is_empty() {
        fallback.to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("My App!!", "my-app")]
    #[case("ws1", "ws1")]
    #[case("--Leading--and--trailing--", "leading-and-trailing")]
    #[case("snake_case.name", "snake-case-name")]
    #[case("tabs\tand  spaces", "tabs-and-spaces")]
    #[case("", "workload")]
    #[case("!!!", "workload")]
    #[case("ÜBER", "ber")]
    fn sanitize_cases(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize(input), expected);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "My App!!",
            "a--b",
            "-x-",
            "A_B_C",
            "  ",
            "ÜBER-Straße",
            "0123456789012345678901234567890123456789012345678901234567890-abc",
            "x.y.z",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn sanitize_caps_label_length_without_trailing_dash() {
        let long = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let out = sanitize(&long);
        assert!(out.len() <= 63);
        assert!(!out.ends_with('-'));
        assert_eq!(sanitize(&out), out);
    }

    #[test]
    fn cluster_slug_uses_its_own_fallback() {
        assert_eq!(cluster_slug(""), "default");
        assert_eq!(cluster_slug("Edge-01"), "edge-01");
    }
}
