//! # tagrelay
//!
//! Server-side Matomo tag relay for e-commerce storefronts. Instead of
//! shipping a JavaScript tracker to the browser, the storefront's own
//! requests are observed server-side: the relay builds a Matomo tracking
//! payload from the request lifecycle (headers, session, domain events) and
//! form-POSTs it to the collector after the response is written.
//!
//! ## Integration
//!
//! The relay can run standalone (the `tagrelay` binary serves the beacon
//! endpoint and tracks whatever is routed through it) or be embedded into a
//! host axum application:
//!
//! ```rust,no_run
//! use axum::{Router, middleware::from_fn_with_state};
//! use tagrelay::{AppState, Config, session::attach_session, tracking::layer::track_requests};
//!
//! # fn shop_routes() -> Router<AppState> { Router::new() }
//! let state = AppState::from_config(Config::default());
//! let app: Router = shop_routes()
//!     .layer(from_fn_with_state(state.clone(), track_requests))
//!     .layer(from_fn_with_state(state.clone(), attach_session))
//!     .with_state(state);
//! ```
//!
//! Handlers report what happened on the page through the
//! [`Tracker`](tracking::Tracker) request extension (category, product and
//! search views, add-to-cart, completed checkouts); everything else is
//! derived from the request itself.

pub mod api;
pub mod config;
pub mod errors;
pub mod orders;
pub mod session;
pub mod telemetry;
pub mod tracking;

use std::sync::Arc;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};
use utoipa::OpenApi;

use crate::{
    api::ApiDoc,
    orders::{InMemoryOrderStore, OrderStore},
    session::SessionStore,
    tracking::MatomoClient,
};

pub use crate::config::Config;

/// Application state shared across all request handlers and the tracking
/// middleware.
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionStore,
    pub matomo: MatomoClient,
    pub orders: Arc<dyn OrderStore>,
}

impl AppState {
    /// State with the in-memory order store, which is all a standalone
    /// deployment needs. Hosts with their own order storage use the builder
    /// and pass their [`OrderStore`].
    pub fn from_config(config: Config) -> Self {
        AppState::builder()
            .sessions(SessionStore::new(config.session.ttl))
            .matomo(MatomoClient::new(config.dispatch_timeout))
            .orders(Arc::new(InMemoryOrderStore::new()) as Arc<dyn OrderStore>)
            .config(Arc::new(config))
            .build()
    }
}

/// Build the relay router: beacon endpoint, health check, API docs, and the
/// session plus tracking middleware around everything.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/matomo-save-resolution", post(api::handlers::resolution::save_resolution))
        .route(
            "/api-docs/openapi.json",
            get(|| async { axum::Json(ApiDoc::openapi()) }),
        );

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    router
        .layer(from_fn_with_state(state.clone(), tracking::layer::track_requests))
        .layer(from_fn_with_state(state.clone(), session::attach_session))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// The relay as a runnable server.
///
/// 1. **Create**: [`Application::new`] builds the state and router from config
/// 2. **Serve**: [`Application::serve`] binds the TCP port and runs until the
///    shutdown future resolves
pub struct Application {
    router: Router,
    config: Arc<Config>,
}

impl Application {
    pub fn new(config: Config) -> Self {
        debug!("Starting tag relay with configuration: {:#?}", config);
        let state = AppState::from_config(config);
        let config = state.config.clone();
        let router = build_router(state);
        Self { router, config }
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("Tag relay listening on http://{bind_addr}");

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
