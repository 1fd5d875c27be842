//! Host string helpers shared by admission and certificate issuance.

/// Drop a trailing `:port`, and the brackets around an IPv6 literal.
///
/// Bare IPv6 addresses without brackets are returned unchanged.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest);
    }

    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

/// Lowercased host without port
pub fn normalize_host(host: &str) -> String {
    strip_port(host.trim()).trim_end_matches('.').to_ascii_lowercase()
}
