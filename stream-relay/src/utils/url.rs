//! URL helpers.

/// Whether `url` is an absolute `<scheme>://` reference with something after the scheme.
///
/// The scheme comparison is ASCII case-insensitive.
pub fn has_scheme(url: &str, scheme: &str) -> bool {
    let Some((found, rest)) = url.split_once("://") else {
        return false;
    };
    found.eq_ignore_ascii_case(scheme) && !rest.trim().is_empty()
}

/// Extracts the `host[:port]` part of a `<scheme>://` URL.
///
/// Returns `None` when the URL has no scheme separator or no host.
pub fn extract_host(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;

    // host[:port] is until first '/', '?', or '#'.
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let mut host_port = &rest[..end];

    // Strip potential userinfo (user:pass@host).
    if let Some(at) = host_port.rfind('@') {
        host_port = &host_port[at + 1..];
    }

    if host_port.is_empty() {
        None
    } else {
        Some(host_port.to_string())
    }
}
