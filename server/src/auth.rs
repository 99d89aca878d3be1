//! Request authentication helpers.
//!
//! Two independent checks live here:
//!
//! - **Admin token** for the management API: the `Authorization: Bearer`
//!   value is compared to `RECOVERY_ADMIN_TOKEN` in constant time.
//! - **Origin check** for the tracking endpoint (opt-in via
//!   `RECOVERY_ENFORCE_ORIGIN`): the host taken from `Origin`, or failing
//!   that `Referer`, must be the tenant's domain or one of its sub-domains.

use axum::http::header::{AUTHORIZATION, ORIGIN, REFERER};
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Compares a presented admin token with the configured one in constant time.
pub fn verify_admin_token(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Host name of the page that sent a request, lower-cased and without port.
///
/// `Origin: null` (sandboxed frames, `file://` pages) yields `None`.
pub fn request_host(headers: &HeaderMap) -> Option<String> {
    [ORIGIN, REFERER]
        .iter()
        .filter_map(|name| headers.get(name)?.to_str().ok())
        .find_map(host_from_url)
}

/// Extracts the host from an absolute URL or a bare host.
fn host_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() || url == "null" {
        return None;
    }
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = host_port.split(':').next().unwrap_or_default();
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Strips scheme, path and a leading `www.` from a configured tenant domain.
fn normalize_domain(domain: &str) -> Option<String> {
    let host = host_from_url(domain)?;
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Returns `true` if `host` is `domain` or a sub-domain of it.
pub fn host_matches_domain(host: &str, domain: &str) -> bool {
    let Some(domain) = normalize_domain(domain) else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'))
}
