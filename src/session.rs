//! Server-side visitor sessions.
//!
//! Tracking needs a small amount of state to survive across requests: the
//! per-visit client id, the screen resolution reported by the client-side
//! beacon, the Google click id captured on landing, and the category browsing
//! context that links navigation pages to the products later added to the
//! cart. All of it lives here, in an in-memory TTL cache keyed by a random
//! session id carried in an HttpOnly cookie.
//!
//! [`attach_session`] is mounted as middleware on every route that needs a
//! [`Session`]; handlers and the tracking layer read it from request
//! extensions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rng;
use tracing::debug;

use crate::{AppState, errors::Error};

/// Name of the session cookie issued by [`attach_session`].
pub const SESSION_COOKIE: &str = "tagrelay_session";

/// Category assignment recorded when a product detail page was viewed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductCategoryEntry {
    pub category: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionData {
    client_id: Option<String>,
    screen: Option<(u32, u32)>,
    google_click_id: Option<String>,
    category_view_name: Option<String>,
    last_parent_id: Option<String>,
    product_categories: HashMap<String, ProductCategoryEntry>,
}

/// Handle to one visitor's session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    id: String,
    data: Arc<RwLock<SessionData>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Per-session tracking client id: 8 random bytes, hex-encoded. Generated
    /// on first access and stable for the lifetime of the session.
    pub fn client_id(&self) -> String {
        if let Some(id) = self.data.read().expect("session lock poisoned").client_id.clone() {
            return id;
        }
        let mut bytes = [0u8; 8];
        rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        self.data.write().expect("session lock poisoned").client_id = Some(id.clone());
        id
    }

    pub fn set_screen(&self, width: u32, height: u32) {
        self.data.write().expect("session lock poisoned").screen = Some((width, height));
    }

    /// Screen resolution as `WxH`, if the client-side beacon reported one.
    pub fn resolution(&self) -> Option<String> {
        self.data
            .read()
            .expect("session lock poisoned")
            .screen
            .map(|(w, h)| format!("{w}x{h}"))
    }

    pub fn set_google_click_id(&self, gclid: &str) {
        self.data.write().expect("session lock poisoned").google_click_id = Some(gclid.to_string());
    }

    pub fn google_click_id(&self) -> Option<String> {
        self.data.read().expect("session lock poisoned").google_click_id.clone()
    }

    pub fn clear_google_click_id(&self) {
        self.data.write().expect("session lock poisoned").google_click_id = None;
    }

    pub fn set_category_view_name(&self, name: Option<String>) {
        self.data.write().expect("session lock poisoned").category_view_name = name;
    }

    pub fn category_view_name(&self) -> Option<String> {
        self.data.read().expect("session lock poisoned").category_view_name.clone()
    }

    pub fn clear_category_view_name(&self) {
        self.set_category_view_name(None);
    }

    pub fn set_last_parent_id(&self, parent_id: Option<String>) {
        self.data.write().expect("session lock poisoned").last_parent_id = parent_id;
    }

    pub fn last_parent_id(&self) -> Option<String> {
        self.data.read().expect("session lock poisoned").last_parent_id.clone()
    }

    pub fn clear_last_parent_id(&self) {
        self.set_last_parent_id(None);
    }

    /// Remember which category a product was viewed under, so cart and order
    /// line items can be attributed to it later in the session.
    pub fn record_product_category(&self, product_number: &str, category: &str) {
        self.data
            .write()
            .expect("session lock poisoned")
            .product_categories
            .insert(
                product_number.to_string(),
                ProductCategoryEntry {
                    category: category.to_string(),
                    seen_at: Utc::now(),
                },
            );
    }

    pub fn product_category(&self, product_number: &str) -> Option<String> {
        self.data
            .read()
            .expect("session lock poisoned")
            .product_categories
            .get(product_number)
            .map(|entry| entry.category.clone())
    }

    pub fn clear_cart_items(&self) {
        self.data.write().expect("session lock poisoned").product_categories.clear();
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Session>().cloned().ok_or_else(|| Error::Internal {
            operation: "read session: attach_session middleware is not mounted".to_string(),
        })
    }
}

/// In-memory session store with idle-TTL eviction.
#[derive(Clone)]
pub struct SessionStore {
    cache: moka::future::Cache<String, Arc<RwLock<SessionData>>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: moka::future::Cache::builder().time_to_idle(ttl).build(),
        }
    }

    /// Resolve the session for a request. Returns the session and whether it
    /// was newly created (in which case the cookie must be set on the response).
    pub async fn attach(&self, cookie_id: Option<&str>) -> (Session, bool) {
        if let Some(id) = cookie_id
            && let Some(data) = self.cache.get(id).await
        {
            return (
                Session {
                    id: id.to_string(),
                    data,
                },
                false,
            );
        }

        let mut bytes = [0u8; 16];
        rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        let data = Arc::new(RwLock::new(SessionData::default()));
        self.cache.insert(id.clone(), data.clone()).await;
        debug!(session_id = %id, "Created new visitor session");
        (Session { id, data }, true)
    }
}

/// Read a cookie value from the request headers.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=')
                && key == name
            {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Middleware that attaches a [`Session`] to every request, issuing the
/// session cookie on first contact.
pub async fn attach_session(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let cookie_id = cookie_value(request.headers(), SESSION_COOKIE);
    let (session, created) = state.sessions.attach(cookie_id.as_deref()).await;
    let session_id = session.id().to_string();
    request.extensions_mut().insert(session);

    let mut response = next.run(request).await;

    if created {
        let cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax");
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build session cookie header");
            }
        }
    }

    response
}
