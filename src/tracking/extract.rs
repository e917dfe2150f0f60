//! Request-to-context extraction.
//!
//! Pulls everything a tracking hit needs out of the incoming request headers,
//! the query string and the visitor session. The storefront sits behind a
//! reverse proxy, so the client IP and the external URL come from the usual
//! forwarding headers.

use axum::http::{HeaderMap, Uri};
use sha2::{Digest, Sha256};
use tracing::trace;
use url::Url;

use crate::{config::TrackingSettings, session::Session};

use super::{
    context::TrackingContext,
    layer::NEW_VISIT_COOKIE,
};

/// Build the tracking context for one request.
pub fn extract_tracking_context(
    uri: &Uri,
    headers: &HeaderMap,
    page_title: Option<&str>,
    session: &Session,
    settings: &TrackingSettings,
    sales_channel_id: &str,
) -> TrackingContext {
    let user_ip = client_ip(headers);
    let url = full_url(uri, headers);
    let title = page_title.map(str::to_string).unwrap_or_else(|| url.clone());

    let campaign_name = campaign_parameter(uri, "mtm_campaign");
    let campaign_keywords = campaign_parameter(uri, "mtm_kwd");

    // A click id on the landing URL is kept in the session so it can be
    // attributed to the order at checkout.
    if let Some(gclid) = campaign_parameter(uri, "gclid") {
        session.set_google_click_id(&gclid);
    }

    let ctx = TrackingContext {
        visitor_id: visitor_id(&user_ip),
        user_ip,
        page_view_id: page_view_id(&title),
        title,
        referer: allowed_referer(&url, headers, settings),
        url,
        resolution: session.resolution(),
        user_agent: header_str(headers, "user-agent").unwrap_or_default(),
        user_agent_data: user_agent_data(headers),
        language: header_str(headers, "accept-language"),
        client_id: session.client_id(),
        new_visit: crate::session::cookie_value(headers, NEW_VISIT_COOKIE).is_some(),
        campaign_name,
        campaign_keywords,
        google_click_id: session.google_click_id(),
        sales_channel_id: sales_channel_id.to_string(),
        ..Default::default()
    };

    trace!(
        url = %ctx.url,
        visitor_id = %ctx.visitor_id,
        page_view_id = %ctx.page_view_id,
        "Extracted tracking context"
    );
    ctx
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Client IP from the forwarding headers, falling back to an empty string when
/// no proxy header is present.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    header_str(headers, "x-real-ip").unwrap_or_default()
}

/// Pseudonymous visitor id: the first 16 hex characters of the SHA-256 digest
/// of the client IP. Stable for an IP, never reversible to one.
pub fn visitor_id(client_ip: &str) -> String {
    let digest = Sha256::digest(client_ip.as_bytes());
    hex::encode(&digest[..8])
}

/// Six-digit page view id derived from the page title. Matomo only needs it
/// to disambiguate hits, not to be cryptographic.
pub fn page_view_id(title: &str) -> String {
    let digest = Sha256::digest(title.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 1_000_000;
    format!("{n:06}")
}

/// Reconstruct the external URL of the request from the forwarding headers.
pub fn full_url(uri: &Uri, headers: &HeaderMap) -> String {
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, "host"))
        .unwrap_or_else(|| "localhost".to_string());
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{scheme}://{host}{path}")
}

/// The `Referer` header, unless it points back at this shop or at one of the
/// configured excluded domains (payment providers, SSO hosts and the like).
pub fn allowed_referer(request_url: &str, headers: &HeaderMap, settings: &TrackingSettings) -> Option<String> {
    let referer = header_str(headers, "referer")?;
    let referer_host = Url::parse(&referer).ok()?.host_str()?.to_ascii_lowercase();

    if let Ok(own) = Url::parse(request_url)
        && own.host_str().map(str::to_ascii_lowercase) == Some(referer_host.clone())
    {
        return None;
    }

    if settings
        .excluded_referrer_domains()
        .any(|domain| domain.eq_ignore_ascii_case(&referer_host))
    {
        return None;
    }

    Some(referer)
}

/// A campaign parameter from the query string, if present and non-empty.
pub fn campaign_parameter(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|v| !v.is_empty())
}

/// Client-hint headers packed into the JSON blob Matomo expects in `uadata`.
/// Absent headers are omitted rather than sent empty.
pub fn user_agent_data(headers: &HeaderMap) -> String {
    const FIELDS: &[(&str, &str)] = &[
        ("model", "sec-ch-ua-model"),
        ("platform", "sec-ch-ua-platform"),
        ("platformVersion", "sec-ch-ua-platform-version"),
        ("browserVersion", "sec-ch-ua-full-version-list"),
        ("mobile", "sec-ch-ua-mobile"),
        ("brands", "sec-ch-ua"),
        ("acceptLanguage", "accept-language"),
        ("doNotTrack", "dnt"),
        ("viewportWidth", "viewport-width"),
        ("viewportHeight", "viewport-height"),
        ("devicePixelRatio", "device-pixel-ratio"),
        ("referrer", "referer"),
        ("connection", "connection"),
        ("acceptEncoding", "accept-encoding"),
    ];

    let mut data = serde_json::Map::new();
    for (key, header) in FIELDS {
        if let Some(value) = header_str(headers, header) {
            data.insert((*key).to_string(), serde_json::Value::String(value));
        }
    }
    serde_json::Value::Object(data).to_string()
}
