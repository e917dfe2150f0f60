//! Server-side Matomo tracking.
//!
//! The pipeline runs in four stages:
//!
//! 1. [`extract`] reads everything a tracking hit needs out of the incoming
//!    request and the visitor session, producing a [`context::TrackingContext`].
//! 2. [`events`] lets the host shop report domain events (category, product
//!    and search page views, add-to-cart, checkout) against that context via
//!    the [`events::Tracker`] request extension.
//! 3. [`payload`] maps the final context onto Matomo's tracking API fields.
//! 4. [`dispatch`] form-POSTs the payload to the collector and records the
//!    outcome.
//!
//! [`layer::track_requests`] ties the stages together as axum middleware.

pub mod context;
pub mod dispatch;
pub mod events;
pub mod extract;
pub mod layer;
pub mod payload;

pub use context::{CartItem, PageTitle, TrackingContext};
pub use dispatch::MatomoClient;
pub use events::Tracker;
