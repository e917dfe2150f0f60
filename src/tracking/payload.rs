//! Context-to-wire mapping for the Matomo tracking HTTP API.
//!
//! Field names follow the collector's tracking API. Optional fields are only
//! emitted when a value exists; the collector treats empty parameters as
//! present, which skews reports.

use chrono::{Local, Timelike};
use rand::prelude::RngExt;

use crate::config::TrackingSettings;

use super::context::TrackingContext;

const DEFAULT_SITE_ID: &str = "1";

/// Ordered form fields for one tracking hit.
#[derive(Debug, Clone, Default)]
pub struct OutboundPayload {
    fields: Vec<(&'static str, String)>,
}

impl OutboundPayload {
    /// The fields every hit carries, regardless of event or ecommerce gating.
    fn required(ctx: &TrackingContext, settings: &TrackingSettings) -> Self {
        let mut payload = Self::default();
        let now = Local::now();

        if let Some(token) = settings.api_token.as_deref().filter(|t| !t.is_empty()) {
            payload.push("token_auth", token);
        }
        payload.push("cip", &ctx.user_ip);
        payload.push(
            "idsite",
            settings.site_id.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SITE_ID),
        );
        payload.push("rec", "1");
        payload.push("action_name", &ctx.title);
        payload.push("url", &ctx.url);
        payload.push("_id", &ctx.visitor_id);
        payload.push("rand", &rand::rng().random::<u32>().to_string());
        payload.push("apiv", "1");
        if let Some(res) = &ctx.resolution {
            payload.push("res", res);
        }
        payload.push("h", &now.hour().to_string());
        payload.push("m", &now.minute().to_string());
        payload.push("s", &now.second().to_string());
        payload.push("ua", &ctx.user_agent);
        payload.push("uadata", &ctx.user_agent_data);
        payload.push("cid", &ctx.client_id);
        payload.push("pv_id", &ctx.page_view_id);
        payload.push("cs", "utf-8");

        payload
    }

    /// Required fields plus the per-visit optionals.
    pub fn base(ctx: &TrackingContext, settings: &TrackingSettings) -> Self {
        let mut payload = Self::required(ctx, settings);

        payload.push_opt("urlref", ctx.referer.as_deref());
        payload.push_opt("lang", ctx.language.as_deref());
        if ctx.new_visit {
            payload.push("new_visit", "1");
        }
        payload.push_opt("_rcn", ctx.campaign_name.as_deref());
        payload.push_opt("_rck", ctx.campaign_keywords.as_deref());
        payload.push_opt("dimension1", ctx.google_click_id.as_deref());
        payload.push_opt("dimension2", ctx.commerce.payment_method.as_deref());
        payload.push_opt("dimension3", ctx.commerce.different_address.as_deref());
        payload.push_opt("dimension4", ctx.commerce.country_billing.as_deref());
        payload.push_opt("dimension5", ctx.commerce.country_shipping.as_deref());

        payload
    }

    /// Reduced hit for cart events: required fields only, plus the cart event
    /// triple and the cart ecommerce fields.
    pub fn cart_event(ctx: &TrackingContext, settings: &TrackingSettings) -> Self {
        let mut payload = Self::required(ctx, settings);

        payload.push_event(ctx, settings);
        if settings.ecommerce_tracking {
            payload.push_opt("idgoal", ctx.commerce.id_goal.as_deref());
            payload.push_opt("ec_items", ctx.commerce.cart_items.as_deref());
            payload.push_money("revenue", ctx.commerce.revenue);
        }

        payload
    }

    /// Full page-view hit: the base fields plus whatever the event and
    /// ecommerce feature toggles allow.
    pub fn page_view(ctx: &TrackingContext, settings: &TrackingSettings) -> Self {
        let mut payload = Self::base(ctx, settings);

        payload.push_event(ctx, settings);

        if settings.ecommerce_tracking {
            let commerce = &ctx.commerce;
            payload.push_opt("idgoal", commerce.id_goal.as_deref());
            payload.push_opt("ec_items", commerce.cart_items.as_deref());
            payload.push_money("revenue", commerce.revenue);
            payload.push_opt("_pkc", commerce.category_name.as_deref());
            payload.push_money("_pkp", commerce.product_price);
            payload.push_opt("_pks", commerce.product_number.as_deref());
            payload.push_opt("_pkn", commerce.product_name.as_deref());
            payload.push_opt("ec_id", commerce.order_number.as_deref());
            payload.push_money("ec_st", commerce.subtotal);
            payload.push_money("ec_tx", commerce.tax);
            payload.push_money("ec_sh", commerce.shipping);
            payload.push_money("ec_dt", commerce.discount);
        }

        payload
    }

    pub fn push(&mut self, name: &'static str, value: &str) {
        self.fields.push((name, value.to_string()));
    }

    fn push_event(&mut self, ctx: &TrackingContext, settings: &TrackingSettings) {
        if settings.event_tracking
            && let Some(event) = &ctx.event
        {
            self.push("e_c", &event.category);
            self.push("e_a", &event.action);
            self.push("e_n", &event.name);
        }
    }

    fn push_opt(&mut self, name: &'static str, value: Option<&str>) {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.push(name, value);
        }
    }

    fn push_money(&mut self, name: &'static str, value: Option<f64>) {
        if let Some(value) = value {
            self.push(name, &format!("{value:.2}"));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Form pairs for the outbound POST body.
    pub fn fields(&self) -> &[(&'static str, String)] {
        &self.fields
    }
}
