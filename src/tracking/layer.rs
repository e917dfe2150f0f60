//! Request lifecycle middleware.
//!
//! Mounted (after [`attach_session`](crate::session::attach_session)) on the
//! storefront routes, this layer builds the tracking context on the way in,
//! exposes a [`Tracker`] to handlers, and dispatches the page-view hit on the
//! way out once the response status is known. Add-to-cart requests dispatch
//! from inside [`Tracker::line_item_added`] instead, so they are counted even
//! though the request itself is not a page view.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method, header},
    middleware::Next,
    response::Response,
};
use tracing::trace;

use crate::{AppState, session::Session};

use super::{context::PageTitle, events::Tracker, extract::extract_tracking_context};

/// Header the reverse proxy (or the host shop) sets to identify the sales
/// channel a request belongs to.
pub const SALES_CHANNEL_HEADER: &str = "x-sales-channel-id";

/// Cookie the client-side bootstrap sets once per browser session; consumed
/// and cleared by the first tracked hit.
pub const NEW_VISIT_COOKIE: &str = "matomo_new_visit";

/// Response statuses that still count as a page view. Errors and redirects
/// outside this set are never reported.
pub const DISPATCH_STATUSES: [u16; 4] = [200, 301, 302, 404];

fn is_page_view_request(request: &Request) -> bool {
    if request.method() != Method::GET {
        return false;
    }
    // Ajax sub-requests render fragments, not pages
    !request
        .headers()
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

/// Observe one request, exposing a [`Tracker`] extension and dispatching the
/// page-view hit after the response.
pub async fn track_requests(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let Some(channel) = request
        .headers()
        .get(SALES_CHANNEL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return next.run(request).await;
    };

    let settings = state.config.for_channel(&channel).clone();
    if !settings.enabled {
        trace!(channel = %channel, "Tracking disabled for channel");
        return next.run(request).await;
    }

    let Some(session) = request.extensions().get::<Session>().cloned() else {
        return next.run(request).await;
    };

    let page_title = request.extensions().get::<PageTitle>().cloned();
    let ctx = extract_tracking_context(
        request.uri(),
        request.headers(),
        page_title.as_ref().map(|t| t.0.as_str()),
        &session,
        &settings,
        &channel,
    );
    let clear_new_visit = ctx.new_visit;

    let tracker = Tracker::new(
        ctx,
        is_page_view_request(&request),
        session,
        settings,
        state.matomo.clone(),
        state.orders.clone(),
    );
    request.extensions_mut().insert(tracker.clone());

    let mut response = next.run(request).await;

    if clear_new_visit {
        response.headers_mut().append(
            header::SET_COOKIE,
            HeaderValue::from_static("matomo_new_visit=; Path=/; Max-Age=0"),
        );
    }

    let status = response.status().as_u16();
    if tracker.auto_dispatch() && DISPATCH_STATUSES.contains(&status) {
        tracker.dispatch_page_view(status).await;
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AppState, Config, config::TrackingSettings, session::attach_session};
    use axum::{Router, http::StatusCode, middleware::from_fn_with_state, routing::get};
    use axum_test::TestServer;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(collector: &MockServer) -> Config {
        Config {
            tracking: TrackingSettings {
                enabled: true,
                matomo_url: Some(collector.uri().parse().unwrap()),
                site_id: Some("1".to_string()),
                event_tracking: true,
                ecommerce_tracking: true,
                ..Default::default()
            },
            channels: [(
                "disabled-channel".to_string(),
                TrackingSettings::default(),
            )]
            .into(),
            ..Default::default()
        }
    }

    fn test_router(config: Config) -> Router {
        let state = AppState::from_config(config);
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/boom", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route("/forbidden", get(|| async { StatusCode::FORBIDDEN }))
            .layer(from_fn_with_state(state.clone(), track_requests))
            .layer(from_fn_with_state(state.clone(), attach_session))
            .with_state(state)
    }

    async fn expect_hits(collector: &MockServer, hits: u64) {
        Mock::given(method("POST"))
            .and(path("/matomo.php"))
            .respond_with(ResponseTemplate::new(200))
            .expect(hits)
            .mount(collector)
            .await;
    }

    #[tokio::test]
    async fn test_ok_page_view_is_dispatched() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/matomo.php"))
            .and(body_string_contains("rec=1"))
            .and(body_string_contains("idsite=1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&collector)
            .await;

        let server = TestServer::new(test_router(test_config(&collector))).unwrap();
        server
            .get("/ok")
            .add_header(SALES_CHANNEL_HEADER, "storefront-main")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_not_found_still_counts_as_page_view() {
        let collector = MockServer::start().await;
        expect_hits(&collector, 1).await;

        let server = TestServer::new(test_router(test_config(&collector))).unwrap();
        let response = server
            .get("/missing")
            .add_header(SALES_CHANNEL_HEADER, "storefront-main")
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_errors_are_not_dispatched() {
        let collector = MockServer::start().await;
        expect_hits(&collector, 0).await;

        let server = TestServer::new(test_router(test_config(&collector))).unwrap();
        server
            .get("/boom")
            .add_header(SALES_CHANNEL_HEADER, "storefront-main")
            .await
            .assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        server
            .get("/forbidden")
            .add_header(SALES_CHANNEL_HEADER, "storefront-main")
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ajax_requests_are_not_dispatched() {
        let collector = MockServer::start().await;
        expect_hits(&collector, 0).await;

        let server = TestServer::new(test_router(test_config(&collector))).unwrap();
        server
            .get("/ok")
            .add_header(SALES_CHANNEL_HEADER, "storefront-main")
            .add_header("x-requested-with", "XMLHttpRequest")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_missing_channel_header_is_not_tracked() {
        let collector = MockServer::start().await;
        expect_hits(&collector, 0).await;

        let server = TestServer::new(test_router(test_config(&collector))).unwrap();
        server.get("/ok").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_disabled_channel_is_not_tracked() {
        let collector = MockServer::start().await;
        expect_hits(&collector, 0).await;

        let server = TestServer::new(test_router(test_config(&collector))).unwrap();
        server
            .get("/ok")
            .add_header(SALES_CHANNEL_HEADER, "disabled-channel")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_new_visit_cookie_is_consumed_and_cleared() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/matomo.php"))
            .and(body_string_contains("new_visit=1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&collector)
            .await;

        let server = TestServer::new(test_router(test_config(&collector))).unwrap();
        let response = server
            .get("/ok")
            .add_header(SALES_CHANNEL_HEADER, "storefront-main")
            .add_header(header::COOKIE, "matomo_new_visit=1")
            .await;
        response.assert_status_ok();

        let cleared = response
            .iter_headers_by_name("set-cookie")
            .any(|v| v.to_str().unwrap().starts_with("matomo_new_visit=") && v.to_str().unwrap().contains("Max-Age=0"));
        assert!(cleared, "expected the new-visit cookie to be cleared");
    }

    #[tokio::test]
    async fn test_session_cookie_is_issued_once() {
        let collector = MockServer::start().await;
        expect_hits(&collector, 2).await;

        let server = TestServer::new(test_router(test_config(&collector))).unwrap();

        let first = server
            .get("/ok")
            .add_header(SALES_CHANNEL_HEADER, "storefront-main")
            .await;
        let session_cookie = first
            .iter_headers_by_name("set-cookie")
            .find(|v| v.to_str().unwrap().starts_with("tagrelay_session="))
            .expect("first response should set the session cookie")
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let second = server
            .get("/ok")
            .add_header(SALES_CHANNEL_HEADER, "storefront-main")
            .add_header(header::COOKIE, session_cookie)
            .await;
        let reissued = second
            .iter_headers_by_name("set-cookie")
            .any(|v| v.to_str().unwrap().starts_with("tagrelay_session="));
        assert!(!reissued, "known sessions should not get a new cookie");
    }
}
