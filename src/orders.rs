//! Order persistence seam.
//!
//! After a successful ecommerce dispatch the relay writes a couple of custom
//! fields back onto the order (the tracked-order marker, and the Google click
//! id captured at landing). The host shop owns order storage, so the relay
//! only talks to it through [`OrderStore`]; the in-memory implementation backs
//! tests and standalone deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

/// Custom field set on an order once the collector has accepted its tracking hit.
pub const ORDER_TRACKED_FIELD: &str = "custom_matomo_tracking_order_success";
/// Custom field carrying the Google Ads click id attributed to the order.
pub const ORDER_GCLID_FIELD: &str = "custom_google_click_id";

/// Write access to order custom fields.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Merge the given custom fields into the order, preserving unrelated keys.
    async fn merge_custom_fields(&self, order_id: &str, fields: Map<String, Value>) -> anyhow::Result<()>;
}

/// In-memory [`OrderStore`] keyed by order id.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<String, Map<String, Value>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current custom fields of an order, if any have been written.
    pub fn custom_fields(&self, order_id: &str) -> Option<Map<String, Value>> {
        self.orders.get(order_id).map(|entry| entry.clone())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn merge_custom_fields(&self, order_id: &str, fields: Map<String, Value>) -> anyhow::Result<()> {
        let mut entry = self.orders.entry(order_id.to_string()).or_default();
        entry.extend(fields);
        Ok(())
    }
}
