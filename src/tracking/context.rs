//! Data carried from request extraction to payload assembly.

use serde_json::json;

/// Page title supplied by the host application as a request extension.
///
/// The host knows the rendered page title; the relay only sees headers. Insert
/// this before the tracking layer runs, or call
/// [`Tracker::set_page_title`](crate::tracking::Tracker::set_page_title) from a
/// handler.
#[derive(Debug, Clone)]
pub struct PageTitle(pub String);

/// A Matomo event triple (`e_c` / `e_a` / `e_n`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEvent {
    pub category: String,
    pub action: String,
    pub name: String,
}

/// One entry of the `ec_items` cart array.
#[derive(Debug, Clone, PartialEq)]
pub struct CartItem {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub unit_price: f64,
    pub quantity: u32,
}

/// Serialize cart items into Matomo's `ec_items` JSON array-of-arrays form:
/// `[[sku, name, category, price, quantity], ...]`.
pub fn encode_cart_items(items: &[CartItem]) -> String {
    let encoded: Vec<_> = items
        .iter()
        .map(|item| json!([item.sku, item.name, item.category, item.unit_price, item.quantity]))
        .collect();
    json!(encoded).to_string()
}

/// Ecommerce fields accumulated across the request lifecycle. Everything is
/// optional; payload assembly only emits what is present.
#[derive(Debug, Clone, Default)]
pub struct CommerceData {
    pub payment_method: Option<String>,
    pub different_address: Option<String>,
    pub country_billing: Option<String>,
    pub country_shipping: Option<String>,
    pub category_name: Option<String>,
    pub product_price: Option<f64>,
    pub product_number: Option<String>,
    pub product_name: Option<String>,
    pub order_number: Option<String>,
    pub subtotal: Option<f64>,
    pub tax: Option<f64>,
    pub shipping: Option<f64>,
    pub discount: Option<f64>,
    pub id_goal: Option<String>,
    pub cart_items: Option<String>,
    pub revenue: Option<f64>,
}

/// Everything known about one tracked request, assembled by
/// [`extract`](super::extract) and enriched by domain events before being
/// mapped onto the wire payload.
#[derive(Debug, Clone, Default)]
pub struct TrackingContext {
    pub user_ip: String,
    pub title: String,
    pub url: String,
    pub visitor_id: String,
    pub referer: Option<String>,
    pub resolution: Option<String>,
    pub user_agent: String,
    pub user_agent_data: String,
    pub language: Option<String>,
    pub client_id: String,
    pub new_visit: bool,
    pub campaign_name: Option<String>,
    pub campaign_keywords: Option<String>,
    pub google_click_id: Option<String>,
    pub page_view_id: String,
    pub sales_channel_id: String,
    pub status_code: Option<u16>,
    pub event: Option<TrackedEvent>,
    pub commerce: CommerceData,
    pub order_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cart_items_encoding() {
        let items = vec![
            CartItem {
                sku: "SW1001".to_string(),
                name: "Trail Shoe".to_string(),
                category: "Shoes".to_string(),
                unit_price: 79.95,
                quantity: 2,
            },
            CartItem {
                sku: "SW2002".to_string(),
                name: "Wool Sock".to_string(),
                category: "unknown".to_string(),
                unit_price: 9.5,
                quantity: 1,
            },
        ];

        let encoded = encode_cart_items(&items);
        let parsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([
                ["SW1001", "Trail Shoe", "Shoes", 79.95, 2],
                ["SW2002", "Wool Sock", "unknown", 9.5, 1]
            ])
        );
    }

    #[test]
    fn test_empty_cart_encodes_to_empty_array() {
        assert_eq!(encode_cart_items(&[]), "[]");
    }
}
