//! Screen resolution beacon.

use axum::{Form, Json, response::IntoResponse};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::{
    errors::{Error, Result},
    session::Session,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveResolution {
    /// Screen width in CSS pixels
    pub width: u32,
    /// Screen height in CSS pixels
    pub height: u32,
}

/// Store the visitor's screen resolution in the session.
///
/// Posted once per session by the client-side bootstrap script; subsequent
/// tracking hits carry the value as the `res` field.
#[utoipa::path(
    post,
    path = "/matomo-save-resolution",
    request_body(content = SaveResolution, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Resolution stored in the visitor session"),
        (status = 400, description = "Zero width or height")
    ),
    tag = "tracking"
)]
#[tracing::instrument(skip(session))]
pub async fn save_resolution(session: Session, Form(beacon): Form<SaveResolution>) -> Result<impl IntoResponse> {
    if beacon.width == 0 || beacon.height == 0 {
        return Err(Error::BadRequest {
            message: "width and height must be non-zero".to_string(),
        });
    }

    session.set_screen(beacon.width, beacon.height);
    Ok(Json(json!({ "success": true })))
}
