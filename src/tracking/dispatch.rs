//! Outbound delivery to the Matomo collector.
//!
//! Dispatch is strictly best-effort: a down or misbehaving collector must
//! never fail a storefront request, so every failure path here logs and
//! returns. Order side effects (the tracked marker) only happen on a 200.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::{Map, json};
use tracing::{debug, error, warn};

use crate::{config::TrackingSettings, orders::{ORDER_TRACKED_FIELD, OrderStore}};

use super::payload::OutboundPayload;

const MAX_LOGGED_BODY: usize = 500;

/// HTTP client for the collector endpoint.
#[derive(Debug, Clone)]
pub struct MatomoClient {
    client: reqwest::Client,
}

// reqwest is built with `rustls-no-provider`, so a crypto provider has to be
// installed before the first client is constructed. Hosts may have installed
// their own already; the result is ignored in that case.
fn install_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

impl MatomoClient {
    pub fn new(timeout: Duration) -> Self {
        install_crypto_provider();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Form-POST one tracking hit. On an accepted ecommerce hit the order is
    /// flagged as tracked; everything else is logged and swallowed.
    pub async fn send(
        &self,
        settings: &TrackingSettings,
        payload: &OutboundPayload,
        order_id: Option<&str>,
        orders: &Arc<dyn OrderStore>,
    ) {
        let Some(endpoint) = settings.collector_endpoint() else {
            debug!("No collector endpoint configured, skipping dispatch");
            return;
        };

        let response = match self.client.post(&endpoint).form(payload.fields()).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Failed to reach tracking collector");
                counter!("tagrelay_dispatch_total", "outcome" => "transport_error").increment(1);
                return;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            debug!(endpoint = %endpoint, "Tracking hit accepted");
            counter!("tagrelay_dispatch_total", "outcome" => "success").increment(1);

            if payload.has("ec_id")
                && let Some(order_id) = order_id
            {
                let mut fields = Map::new();
                fields.insert(ORDER_TRACKED_FIELD.to_string(), json!(true));
                if let Err(e) = orders.merge_custom_fields(order_id, fields).await {
                    error!(order_id = %order_id, error = %e, "Failed to flag order as tracked");
                }
            }
            return;
        }

        let body = response.text().await.unwrap_or_default();
        let truncated: String = body.chars().take(MAX_LOGGED_BODY).collect();
        error!(
            endpoint = %endpoint,
            status = %status,
            body = %truncated,
            "Tracking collector rejected hit"
        );
        counter!("tagrelay_dispatch_total", "outcome" => "rejected").increment(1);
    }
}
