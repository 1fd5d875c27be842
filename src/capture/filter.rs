//! Predicate evaluation for capture queries.

use super::types::{CapturedRequest, FilterOptions, HeaderValues};

/// Bodies larger than this are skipped by free-text search
pub const MAX_SEARCHABLE_BODY: usize = 1024 * 1024;

const TEXTUAL_MARKERS: &[&str] = &[
    "text/",
    "json",
    "xml",
    "javascript",
    "x-www-form-urlencoded",
];

/// Match a host against an exact name or a `*.suffix` wildcard.
///
/// The wildcard only covers subdomains: `*.example.com` matches
/// `api.example.com` but not `example.com`. Comparison ignores ASCII case.
pub fn match_host(host: &str, pattern: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            let (host, suffix) = (host.as_bytes(), suffix.as_bytes());
            host.len() > suffix.len() + 1
                && host[host.len() - suffix.len() - 1] == b'.'
                && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
        }
        None => host.eq_ignore_ascii_case(pattern),
    }
}

/// Whether a body with the given content type can be searched as text.
///
/// With no content type at all the bytes decide: valid UTF-8 counts as text.
pub fn is_textual(content_type: Option<&str>, body: &[u8]) -> bool {
    match content_type {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            TEXTUAL_MARKERS.iter().any(|marker| ct.contains(marker))
        }
        None => std::str::from_utf8(body).is_ok(),
    }
}

/// True when every configured sub-filter accepts the capture
pub fn matches_filter(capture: &CapturedRequest, filter: &FilterOptions) -> bool {
    if let Some(method) = &filter.method {
        if !capture.method.eq_ignore_ascii_case(method) {
            return false;
        }
    }

    if let Some(pattern) = &filter.host {
        if !match_host(&capture.host, pattern) {
            return false;
        }
    }

    if let Some(prefix) = &filter.path_prefix {
        if !capture.path.starts_with(prefix.as_str()) {
            return false;
        }
    }

    if filter.status_min.is_some_and(|min| capture.status_code < min)
        || filter.status_max.is_some_and(|max| capture.status_code > max)
    {
        return false;
    }

    if let Some(prefix) = &filter.content_type {
        let matches = capture
            .content_type()
            .map(|ct| starts_with_ignore_case(ct, prefix))
            .unwrap_or(false);
        if !matches {
            return false;
        }
    }

    if filter.min_size.is_some_and(|min| capture.response_size < min)
        || filter.max_size.is_some_and(|max| capture.response_size > max)
    {
        return false;
    }

    if filter.after.is_some_and(|after| capture.timestamp < after)
        || filter.before.is_some_and(|before| capture.timestamp > before)
    {
        return false;
    }

    if (filter.https_only && !capture.is_https) || (filter.http_only && capture.is_https) {
        return false;
    }

    match &filter.search {
        Some(term) if !term.is_empty() => matches_search(capture, &term.to_lowercase()),
        _ => true,
    }
}

fn matches_search(capture: &CapturedRequest, needle: &str) -> bool {
    let contains = |haystack: &str| haystack.to_lowercase().contains(needle);

    if contains(&capture.url) || contains(&capture.host) || contains(&capture.path) {
        return true;
    }

    if headers_contain(&capture.request_headers, &contains)
        || headers_contain(&capture.response_headers, &contains)
    {
        return true;
    }

    body_contains(
        capture.request_header("content-type"),
        &capture.request_body,
        &contains,
    ) || body_contains(capture.content_type(), &capture.response_body, &contains)
}

fn headers_contain(headers: &HeaderValues, contains: &impl Fn(&str) -> bool) -> bool {
    headers
        .iter()
        .any(|(name, values)| contains(name) || values.iter().any(|v| contains(v)))
}

fn body_contains(
    content_type: Option<&str>,
    body: &[u8],
    contains: &impl Fn(&str) -> bool,
) -> bool {
    if body.is_empty() || body.len() >= MAX_SEARCHABLE_BODY || !is_textual(content_type, body) {
        return false;
    }
    contains(&String::from_utf8_lossy(body))
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
