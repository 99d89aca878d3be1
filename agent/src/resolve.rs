//! Tracking-id resolution.
//!
//! Sources are tried in order:
//!
//! 1. the `id` query parameter of the agent's script URL (relative URLs are
//!    resolved against the page URL),
//! 2. the `tracking_id` query parameter of the page URL,
//! 3. the configured fallback id.
//!
//! With the fallback disabled, resolution can fail; the agent then stays
//! silent and never contacts the server.

use reqwest::Url;

/// Query parameter read from the script URL.
const SCRIPT_PARAM: &str = "id";

/// Query parameter read from the page URL.
const PAGE_PARAM: &str = "tracking_id";

/// Where a tracking id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingIdSource {
    ScriptUrl,
    PageUrl,
    Fallback,
}

/// A resolved tracking id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTrackingId {
    pub tracking_id: String,
    pub source: TrackingIdSource,
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses `script_src`, resolving it against the page URL when relative.
fn script_url(script_src: &str, page: Option<&Url>) -> Option<Url> {
    match page {
        Some(base) => base.join(script_src).ok(),
        None => Url::parse(script_src).ok(),
    }
}

/// Resolves the tracking id for a page.
pub fn resolve_tracking_id(
    script_src: Option<&str>,
    page_url: &str,
    fallback: Option<&str>,
) -> Option<ResolvedTrackingId> {
    let page = Url::parse(page_url).ok();

    let from_script = script_src
        .and_then(|src| script_url(src, page.as_ref()))
        .and_then(|url| query_param(&url, SCRIPT_PARAM))
        .map(|id| (id, TrackingIdSource::ScriptUrl));

    let from_page = || {
        page.as_ref()
            .and_then(|url| query_param(url, PAGE_PARAM))
            .map(|id| (id, TrackingIdSource::PageUrl))
    };

    let from_fallback = || {
        fallback
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| (id.to_string(), TrackingIdSource::Fallback))
    };

    from_script
        .or_else(from_page)
        .or_else(from_fallback)
        .map(|(tracking_id, source)| ResolvedTrackingId {
            tracking_id,
            source,
        })
}

/// Origin (`scheme://host[:port]`) of the script URL, where the tracking
/// endpoint lives. Falls back to the page origin.
pub fn endpoint_origin(script_src: Option<&str>, page_url: &str) -> Option<String> {
    let page = Url::parse(page_url).ok();
    script_src
        .and_then(|src| script_url(src, page.as_ref()))
        .or(page)
        .filter(|url| url.has_host())
        .map(|url| url.origin().ascii_serialization())
}
