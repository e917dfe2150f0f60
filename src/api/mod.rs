//! HTTP API surface of the relay itself.
//!
//! The storefront traffic flows through the tracking middleware; the only
//! first-party endpoint is the client-side beacon that reports the screen
//! resolution into the visitor session.

pub mod handlers;

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "tagrelay",
        description = "Server-side Matomo tag relay for e-commerce storefronts"
    ),
    paths(handlers::resolution::save_resolution),
    components(schemas(handlers::resolution::SaveResolution))
)]
pub struct ApiDoc;
