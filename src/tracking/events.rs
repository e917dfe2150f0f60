//! Domain events reported by the host shop.
//!
//! The tracking layer inserts a [`Tracker`] into request extensions; the host
//! application (or route handlers) report what actually happened on the page
//! through it. Navigation events enrich the pending page-view context, while
//! add-to-cart dispatches its own hit immediately so it is counted even when
//! the surrounding request is not a trackable page view.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::{
    config::TrackingSettings,
    orders::{ORDER_GCLID_FIELD, OrderStore},
    session::Session,
};

use super::{
    context::{CartItem, TrackedEvent, TrackingContext, encode_cart_items},
    dispatch::MatomoClient,
    payload::OutboundPayload,
};

/// Fallback label for categories, payment methods and countries the relay
/// cannot resolve.
pub const UNKNOWN: &str = "unknown";

/// A category listing page was rendered.
#[derive(Debug, Clone)]
pub struct CategoryPageView {
    pub category_id: String,
    pub category_name: String,
}

/// A product detail page was rendered.
#[derive(Debug, Clone)]
pub struct ProductPageView {
    pub product_number: String,
    pub product_name: String,
    /// Id of the navigation category the product was opened from, when known.
    pub parent_id: Option<String>,
    pub unit_price: f64,
    /// Category breadcrumb of the product, outermost first.
    pub breadcrumb: Vec<String>,
}

/// A search result page was rendered.
#[derive(Debug, Clone)]
pub struct SearchPageView {
    pub term: String,
    pub result_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineItemKind {
    Product,
    Promotion,
    Other,
}

/// One line item of a cart or order.
#[derive(Debug, Clone)]
pub struct CartLineItem {
    pub product_number: Option<String>,
    pub label: Option<String>,
    pub payload_name: Option<String>,
    pub unit_price: f64,
    pub total_price: f64,
    pub quantity: u32,
    pub kind: LineItemKind,
}

/// The cart at the moment a line item was added.
#[derive(Debug, Clone)]
pub struct CartSnapshot {
    pub total: f64,
    pub line_items: Vec<CartLineItem>,
}

/// An order's billing or shipping address, for the address-comparison
/// dimension.
#[derive(Debug, Clone, Default)]
pub struct OrderAddress {
    pub street: String,
    pub zipcode: String,
    pub city: String,
    pub country_id: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub country_name: Option<String>,
}

impl OrderAddress {
    /// Recipient comparison for the address dimension. The resolved country
    /// name is display data and stays out of it.
    fn same_recipient(&self, other: &OrderAddress) -> bool {
        self.street == other.street
            && self.zipcode == other.zipcode
            && self.city == other.city
            && self.country_id == other.country_id
            && self.first_name == other.first_name
            && self.last_name == other.last_name
            && self.company == other.company
    }
}

/// A completed checkout.
#[derive(Debug, Clone)]
pub struct CompletedOrder {
    pub id: String,
    pub order_number: String,
    pub amount_total: f64,
    pub amount_net: f64,
    pub tax_amount: f64,
    pub shipping_total: f64,
    pub line_items: Vec<CartLineItem>,
    pub payment_method: Option<String>,
    pub billing: OrderAddress,
    pub shipping: Option<OrderAddress>,
}

struct TrackerInner {
    ctx: Mutex<Option<TrackingContext>>,
    auto_dispatch: bool,
    session: Session,
    settings: TrackingSettings,
    matomo: MatomoClient,
    orders: Arc<dyn OrderStore>,
}

/// Per-request tracking handle, available as a request extension on tracked
/// routes. Cheap to clone; all clones share the pending context.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    pub(crate) fn new(
        ctx: TrackingContext,
        auto_dispatch: bool,
        session: Session,
        settings: TrackingSettings,
        matomo: MatomoClient,
        orders: Arc<dyn OrderStore>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                ctx: Mutex::new(Some(ctx)),
                auto_dispatch,
                session,
                settings,
                matomo,
                orders,
            }),
        }
    }

    /// Whether the surrounding request qualifies for a page-view hit once the
    /// response status is known.
    pub(crate) fn auto_dispatch(&self) -> bool {
        self.inner.auto_dispatch
    }

    fn with_ctx(&self, f: impl FnOnce(&mut TrackingContext)) {
        let mut guard = self.inner.ctx.lock().expect("tracker lock poisoned");
        if let Some(ctx) = guard.as_mut() {
            f(ctx);
        }
    }

    /// Override the action name of the pending hit. The page-view id stays
    /// bound to the title the request was extracted with.
    pub fn set_page_title(&self, title: &str) {
        let title = title.to_string();
        self.with_ctx(|ctx| ctx.title = title);
    }

    /// Report a rendered category listing page.
    pub fn category_page_loaded(&self, view: &CategoryPageView) {
        let session = &self.inner.session;
        session.set_category_view_name(Some(view.category_name.clone()));
        session.clear_last_parent_id();
        debug!(category_id = %view.category_id, category = %view.category_name, "Category page viewed");

        let name = slug(&view.category_name);
        let category_name = view.category_name.clone();
        self.with_ctx(|ctx| {
            ctx.event = Some(TrackedEvent {
                category: "category".to_string(),
                action: "view".to_string(),
                name,
            });
            ctx.commerce.category_name = Some(category_name);
        });
    }

    /// Report a rendered product detail page.
    pub fn product_page_loaded(&self, view: &ProductPageView) {
        let session = &self.inner.session;

        // The category name cached at the last listing page applies as long
        // as the visitor stays within the same navigation branch. Once the
        // branch changes, the product's own breadcrumb is the best we have.
        let same_branch = match session.last_parent_id() {
            None => true,
            Some(last) => view.parent_id.as_deref() == Some(last.as_str()),
        };
        let category = if same_branch {
            session.category_view_name()
        } else {
            None
        }
        .or_else(|| view.breadcrumb.last().cloned())
        .unwrap_or_else(|| UNKNOWN.to_string());

        session.set_last_parent_id(view.parent_id.clone());
        session.record_product_category(&view.product_number, &category);
        debug!(
            product_number = %view.product_number,
            category = %category,
            "Product page viewed"
        );

        let name = slug(&view.product_name);
        self.with_ctx(|ctx| {
            ctx.event = Some(TrackedEvent {
                category: "product".to_string(),
                action: "view".to_string(),
                name,
            });
            ctx.commerce.category_name = Some(category);
            ctx.commerce.product_price = Some(view.unit_price);
            ctx.commerce.product_number = Some(view.product_number.clone());
            ctx.commerce.product_name = Some(view.product_name.clone());
        });
    }

    /// Report a rendered search result page. The raw term stays out of the
    /// payload; only the event name carries a slug of it.
    pub fn search_page_loaded(&self, view: &SearchPageView) {
        debug!(term = %view.term, results = view.result_count, "Search page viewed");

        let name = slug(&view.term);
        self.with_ctx(|ctx| {
            ctx.event = Some(TrackedEvent {
                category: "search".to_string(),
                action: "view".to_string(),
                name,
            });
        });
    }

    /// Report a line item added to the cart. Dispatches its own hit
    /// immediately instead of waiting for the response.
    pub async fn line_item_added(&self, cart: &CartSnapshot) {
        let settings = &self.inner.settings;
        if !settings.event_tracking && !settings.ecommerce_tracking {
            debug!("Event and ecommerce tracking disabled, skipping cart event");
            return;
        }

        let session = &self.inner.session;
        let items: Vec<CartItem> = cart
            .line_items
            .iter()
            .filter(|item| {
                if item.kind == LineItemKind::Product {
                    true
                } else {
                    debug!(kind = ?item.kind, "Skipping non-product cart line item");
                    false
                }
            })
            .filter_map(|item| cart_item_entry(item, session))
            .collect();
        if items.is_empty() {
            debug!("No trackable product line items in cart, skipping cart event");
            return;
        }

        let Some(mut ctx) = self
            .inner
            .ctx
            .lock()
            .expect("tracker lock poisoned")
            .clone()
        else {
            return;
        };

        ctx.event = Some(TrackedEvent {
            category: "cart".to_string(),
            action: "click".to_string(),
            name: "add_to_cart".to_string(),
        });
        ctx.commerce.id_goal = Some("0".to_string());
        ctx.commerce.cart_items = Some(encode_cart_items(&items));
        ctx.commerce.revenue = Some(cart.total);

        let payload = OutboundPayload::cart_event(&ctx, &self.inner.settings);
        self.inner
            .matomo
            .send(&self.inner.settings, &payload, None, &self.inner.orders)
            .await;
    }

    /// Report a completed checkout. Enriches the pending page view with the
    /// ecommerce order fields and attributes the stored click id to the order.
    pub async fn checkout_finished(&self, order: &CompletedOrder) {
        let session = &self.inner.session;

        if let Some(gclid) = session.google_click_id() {
            let mut fields = serde_json::Map::new();
            fields.insert(ORDER_GCLID_FIELD.to_string(), serde_json::json!(gclid));
            if let Err(e) = self.inner.orders.merge_custom_fields(&order.id, fields).await {
                error!(order_id = %order.id, error = %e, "Failed to store click id on order");
            } else {
                session.clear_google_click_id();
            }
        }

        if order.line_items.is_empty() {
            error!(order_number = %order.order_number, "Order finished without line items, skipping enrichment");
            return;
        }

        let items: Vec<CartItem> = order
            .line_items
            .iter()
            .filter(|item| item.kind == LineItemKind::Product)
            .filter_map(|item| cart_item_entry(item, session))
            .collect();

        let discount: f64 = order
            .line_items
            .iter()
            .filter(|item| item.kind == LineItemKind::Promotion)
            .map(|item| item.total_price.abs())
            .sum();

        let payment = order
            .payment_method
            .clone()
            .unwrap_or_else(|| UNKNOWN.to_string());
        let country_billing = order
            .billing
            .country_name
            .clone()
            .unwrap_or_else(|| UNKNOWN.to_string());
        let (address_cmp, country_shipping) = match &order.shipping {
            Some(shipping) => (
                if shipping.same_recipient(&order.billing) {
                    "billing == shipping"
                } else {
                    "billing != shipping"
                },
                shipping.country_name.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            ),
            None => (UNKNOWN, UNKNOWN.to_string()),
        };

        self.with_ctx(|ctx| {
            ctx.event = Some(TrackedEvent {
                category: "order".to_string(),
                action: "view".to_string(),
                name: "purchase".to_string(),
            });
            ctx.order_id = Some(order.id.clone());
            ctx.commerce.id_goal = Some("0".to_string());
            ctx.commerce.order_number = Some(order.order_number.clone());
            ctx.commerce.revenue = Some(order.amount_total);
            ctx.commerce.subtotal = Some(order.amount_net);
            ctx.commerce.tax = Some(order.tax_amount);
            ctx.commerce.shipping = Some(order.shipping_total);
            ctx.commerce.discount = Some(discount);
            ctx.commerce.cart_items = Some(encode_cart_items(&items));
            ctx.commerce.payment_method = Some(payment);
            ctx.commerce.different_address = Some(address_cmp.to_string());
            ctx.commerce.country_billing = Some(country_billing);
            ctx.commerce.country_shipping = Some(country_shipping);
        });

        session.clear_cart_items();
    }

    /// Take the pending context for dispatch. Subsequent calls return `None`,
    /// so a hit can only ever go out once per request.
    pub(crate) fn take_context(&self) -> Option<TrackingContext> {
        self.inner.ctx.lock().expect("tracker lock poisoned").take()
    }

    /// Dispatch the pending page view with the response status attached.
    pub(crate) async fn dispatch_page_view(&self, status: u16) {
        let Some(mut ctx) = self.take_context() else {
            return;
        };
        ctx.status_code = Some(status);
        let order_id = ctx.order_id.clone();
        let payload = OutboundPayload::page_view(&ctx, &self.inner.settings);
        self.inner
            .matomo
            .send(&self.inner.settings, &payload, order_id.as_deref(), &self.inner.orders)
            .await;
    }
}

/// Resolve a cart line item into an `ec_items` entry, warning about fallbacks
/// the shop should clean up.
pub(crate) fn cart_item_entry(item: &CartLineItem, session: &Session) -> Option<CartItem> {
    let sku = match &item.product_number {
        Some(number) if !number.is_empty() => number.clone(),
        _ => {
            warn!(label = ?item.label, "Cart line item without product number, skipping");
            return None;
        }
    };

    let name = match (&item.label, &item.payload_name) {
        (Some(label), _) if !label.is_empty() => label.clone(),
        (_, Some(payload_name)) if !payload_name.is_empty() => {
            warn!(sku = %sku, "Cart line item without label, using payload name");
            payload_name.clone()
        }
        _ => {
            warn!(sku = %sku, "Cart line item without label or payload name, using product number");
            sku.clone()
        }
    };

    let category = session.product_category(&sku).unwrap_or_else(|| UNKNOWN.to_string());

    Some(CartItem {
        sku,
        name,
        category,
        unit_price: item.unit_price,
        quantity: item.quantity,
    })
}

/// Event-name slug: lowercased, alphanumeric runs joined by single
/// underscores.
pub(crate) fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_separator = false;
    for c in input.chars() {
        if c.is_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            for lower in c.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_separator = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::InMemoryOrderStore;
    use crate::session::SessionStore;
    use std::time::Duration;

    fn product_item(number: &str, label: Option<&str>) -> CartLineItem {
        CartLineItem {
            product_number: Some(number.to_string()),
            label: label.map(str::to_string),
            payload_name: None,
            unit_price: 79.95,
            total_price: 159.9,
            quantity: 2,
            kind: LineItemKind::Product,
        }
    }

    async fn tracker_with_settings(settings: TrackingSettings) -> (Tracker, Session) {
        let store = SessionStore::new(Duration::from_secs(60));
        let (session, _) = store.attach(None).await;
        let orders: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
        let tracker = Tracker::new(
            TrackingContext::default(),
            true,
            session.clone(),
            settings,
            MatomoClient::new(Duration::from_secs(1)),
            orders,
        );
        (tracker, session)
    }

    async fn tracker_with_session() -> (Tracker, Session) {
        tracker_with_settings(TrackingSettings {
            event_tracking: true,
            ecommerce_tracking: true,
            ..Default::default()
        })
        .await
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Trail Shoe"), "trail_shoe");
        assert_eq!(slug("  Schuhe & Stiefel  "), "schuhe_stiefel");
        assert_eq!(slug("UPPER-case_123"), "upper_case_123");
        assert_eq!(slug("äöü"), "äöü");
        assert_eq!(slug(""), "");
    }

    #[tokio::test]
    async fn test_category_page_caches_name_and_sets_event() {
        let (tracker, session) = tracker_with_session().await;
        session.set_last_parent_id(Some("stale".to_string()));

        tracker.category_page_loaded(&CategoryPageView {
            category_id: "cat-1".to_string(),
            category_name: "Trail Shoes".to_string(),
        });

        assert_eq!(session.category_view_name().as_deref(), Some("Trail Shoes"));
        assert_eq!(session.last_parent_id(), None);

        let ctx = tracker.take_context().unwrap();
        let event = ctx.event.unwrap();
        assert_eq!(event.category, "category");
        assert_eq!(event.action, "view");
        assert_eq!(event.name, "trail_shoes");
        assert_eq!(ctx.commerce.category_name.as_deref(), Some("Trail Shoes"));
    }

    #[tokio::test]
    async fn test_product_in_same_branch_uses_cached_category() {
        let (tracker, session) = tracker_with_session().await;
        session.set_category_view_name(Some("Trail Shoes".to_string()));

        tracker.product_page_loaded(&ProductPageView {
            product_number: "SW1001".to_string(),
            product_name: "Trail Shoe".to_string(),
            parent_id: Some("cat-1".to_string()),
            unit_price: 79.95,
            breadcrumb: vec!["Shoes".to_string(), "Running".to_string()],
        });

        assert_eq!(session.product_category("SW1001").as_deref(), Some("Trail Shoes"));
        assert_eq!(session.last_parent_id().as_deref(), Some("cat-1"));

        let ctx = tracker.take_context().unwrap();
        assert_eq!(ctx.commerce.category_name.as_deref(), Some("Trail Shoes"));
        assert_eq!(ctx.commerce.product_number.as_deref(), Some("SW1001"));
        assert_eq!(ctx.commerce.product_price, Some(79.95));
        assert_eq!(ctx.event.unwrap().name, "trail_shoe");
    }

    #[tokio::test]
    async fn test_product_in_other_branch_falls_back_to_breadcrumb() {
        let (tracker, session) = tracker_with_session().await;
        session.set_category_view_name(Some("Trail Shoes".to_string()));
        session.set_last_parent_id(Some("cat-1".to_string()));

        tracker.product_page_loaded(&ProductPageView {
            product_number: "SW2002".to_string(),
            product_name: "Wool Sock".to_string(),
            parent_id: Some("cat-2".to_string()),
            unit_price: 9.5,
            breadcrumb: vec!["Clothing".to_string(), "Socks".to_string()],
        });

        assert_eq!(session.product_category("SW2002").as_deref(), Some("Socks"));
    }

    #[tokio::test]
    async fn test_product_without_any_category_is_unknown() {
        let (tracker, session) = tracker_with_session().await;
        session.set_last_parent_id(Some("cat-1".to_string()));

        tracker.product_page_loaded(&ProductPageView {
            product_number: "SW3003".to_string(),
            product_name: "Gift Card".to_string(),
            parent_id: None,
            unit_price: 25.0,
            breadcrumb: vec![],
        });

        assert_eq!(session.product_category("SW3003").as_deref(), Some(UNKNOWN));
    }

    #[tokio::test]
    async fn test_search_event_keeps_term_out_of_context() {
        let (tracker, _session) = tracker_with_session().await;

        tracker.search_page_loaded(&SearchPageView {
            term: "Trail Shoe 44".to_string(),
            result_count: 12,
        });

        let ctx = tracker.take_context().unwrap();
        let event = ctx.event.unwrap();
        assert_eq!(event.category, "search");
        assert_eq!(event.name, "trail_shoe_44");
        assert_eq!(ctx.commerce.cart_items, None);
    }

    #[tokio::test]
    async fn test_cart_item_entry_fallbacks() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (session, _) = store.attach(None).await;
        session.record_product_category("SW1001", "Trail Shoes");

        let entry = cart_item_entry(&product_item("SW1001", Some("Trail Shoe")), &session).unwrap();
        assert_eq!(entry.category, "Trail Shoes");
        assert_eq!(entry.name, "Trail Shoe");

        // Label missing, payload name used
        let mut item = product_item("SW9999", None);
        item.payload_name = Some("trail-shoe".to_string());
        let entry = cart_item_entry(&item, &session).unwrap();
        assert_eq!(entry.name, "trail-shoe");
        assert_eq!(entry.category, UNKNOWN);

        // No label or payload name falls back to the product number
        let entry = cart_item_entry(&product_item("SW7777", None), &session).unwrap();
        assert_eq!(entry.name, "SW7777");

        // No product number means no entry
        let mut item = product_item("", Some("Mystery"));
        item.product_number = None;
        assert!(cart_item_entry(&item, &session).is_none());
    }

    #[tokio::test]
    async fn test_line_item_added_dispatches_immediately() {
        use wiremock::matchers::{body_string_contains, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/matomo.php"))
            .and(body_string_contains("e_c=cart"))
            .and(body_string_contains("e_n=add_to_cart"))
            .and(body_string_contains("idgoal=0"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&collector)
            .await;

        let (tracker, session) = tracker_with_settings(TrackingSettings {
            enabled: true,
            matomo_url: Some(collector.uri().parse().unwrap()),
            event_tracking: true,
            ecommerce_tracking: true,
            ..Default::default()
        })
        .await;
        session.record_product_category("SW1001", "Trail Shoes");

        tracker
            .line_item_added(&CartSnapshot {
                total: 159.9,
                line_items: vec![product_item("SW1001", Some("Trail Shoe"))],
            })
            .await;

        // The pending page-view context stays untouched
        let ctx = tracker.take_context().unwrap();
        assert_eq!(ctx.event, None);
        assert_eq!(ctx.commerce.cart_items, None);
    }

    #[tokio::test]
    async fn test_cart_event_requires_a_tracking_toggle() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/matomo.php"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&collector)
            .await;

        let (tracker, session) = tracker_with_settings(TrackingSettings {
            enabled: true,
            matomo_url: Some(collector.uri().parse().unwrap()),
            event_tracking: false,
            ecommerce_tracking: false,
            ..Default::default()
        })
        .await;
        session.record_product_category("SW1001", "Trail Shoes");

        tracker
            .line_item_added(&CartSnapshot {
                total: 159.9,
                line_items: vec![product_item("SW1001", Some("Trail Shoe"))],
            })
            .await;
    }

    #[tokio::test]
    async fn test_cart_without_products_dispatches_nothing() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/matomo.php"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&collector)
            .await;

        let (tracker, _session) = tracker_with_settings(TrackingSettings {
            enabled: true,
            matomo_url: Some(collector.uri().parse().unwrap()),
            event_tracking: true,
            ecommerce_tracking: true,
            ..Default::default()
        })
        .await;

        tracker
            .line_item_added(&CartSnapshot {
                total: -10.0,
                line_items: vec![CartLineItem {
                    product_number: None,
                    label: Some("Summer promotion".to_string()),
                    payload_name: None,
                    unit_price: -10.0,
                    total_price: -10.0,
                    quantity: 1,
                    kind: LineItemKind::Promotion,
                }],
            })
            .await;
    }

    #[tokio::test]
    async fn test_checkout_enriches_context_and_clears_session() {
        let (tracker, session) = tracker_with_session().await;
        session.set_google_click_id("Cj0KCQ");
        session.record_product_category("SW1001", "Trail Shoes");

        let order = CompletedOrder {
            id: "order-1".to_string(),
            order_number: "10077".to_string(),
            amount_total: 159.9,
            amount_net: 134.37,
            tax_amount: 25.53,
            shipping_total: 4.9,
            line_items: vec![
                product_item("SW1001", Some("Trail Shoe")),
                CartLineItem {
                    product_number: None,
                    label: Some("Summer promotion".to_string()),
                    payload_name: None,
                    unit_price: -10.0,
                    total_price: -10.0,
                    quantity: 1,
                    kind: LineItemKind::Promotion,
                },
            ],
            payment_method: Some("Invoice".to_string()),
            billing: OrderAddress {
                street: "Main St 1".to_string(),
                zipcode: "12345".to_string(),
                city: "Springfield".to_string(),
                country_id: "de".to_string(),
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                company: None,
                country_name: Some("Germany".to_string()),
            },
            shipping: None,
        };

        tracker.checkout_finished(&order).await;

        assert_eq!(session.google_click_id(), None);
        assert_eq!(session.product_category("SW1001"), None);

        let ctx = tracker.take_context().unwrap();
        assert_eq!(ctx.order_id.as_deref(), Some("order-1"));
        assert_eq!(ctx.commerce.order_number.as_deref(), Some("10077"));
        assert_eq!(ctx.commerce.revenue, Some(159.9));
        assert_eq!(ctx.commerce.discount, Some(10.0));
        assert_eq!(ctx.commerce.payment_method.as_deref(), Some("Invoice"));
        // No shipping address on the order: comparison and country unknown
        assert_eq!(ctx.commerce.different_address.as_deref(), Some(UNKNOWN));
        assert_eq!(ctx.commerce.country_billing.as_deref(), Some("Germany"));
        assert_eq!(ctx.commerce.country_shipping.as_deref(), Some(UNKNOWN));
        assert_eq!(ctx.event.unwrap().category, "order");

        let items: serde_json::Value = serde_json::from_str(ctx.commerce.cart_items.as_deref().unwrap()).unwrap();
        assert_eq!(items, serde_json::json!([["SW1001", "Trail Shoe", "Trail Shoes", 79.95, 2]]));
    }

    #[tokio::test]
    async fn test_checkout_with_different_shipping_address() {
        let (tracker, _session) = tracker_with_session().await;

        let billing = OrderAddress {
            street: "Main St 1".to_string(),
            country_name: Some("Germany".to_string()),
            ..Default::default()
        };
        let shipping = OrderAddress {
            street: "Other St 2".to_string(),
            country_name: Some("Austria".to_string()),
            ..Default::default()
        };

        let order = CompletedOrder {
            id: "order-2".to_string(),
            order_number: "10078".to_string(),
            amount_total: 50.0,
            amount_net: 42.0,
            tax_amount: 8.0,
            shipping_total: 0.0,
            line_items: vec![product_item("SW1001", Some("Trail Shoe"))],
            payment_method: None,
            billing,
            shipping: Some(shipping),
        };

        tracker.checkout_finished(&order).await;

        let ctx = tracker.take_context().unwrap();
        assert_eq!(ctx.commerce.different_address.as_deref(), Some("billing != shipping"));
        assert_eq!(ctx.commerce.payment_method.as_deref(), Some(UNKNOWN));
        assert_eq!(ctx.commerce.country_billing.as_deref(), Some("Germany"));
        assert_eq!(ctx.commerce.country_shipping.as_deref(), Some("Austria"));
    }

    #[tokio::test]
    async fn test_same_recipient_ignores_country_name() {
        let (tracker, _session) = tracker_with_session().await;

        let billing = OrderAddress {
            street: "Main St 1".to_string(),
            zipcode: "12345".to_string(),
            city: "Springfield".to_string(),
            country_id: "de".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            company: None,
            country_name: Some("Germany".to_string()),
        };
        let shipping = OrderAddress {
            country_name: None,
            ..billing.clone()
        };

        let order = CompletedOrder {
            id: "order-4".to_string(),
            order_number: "10080".to_string(),
            amount_total: 50.0,
            amount_net: 42.0,
            tax_amount: 8.0,
            shipping_total: 0.0,
            line_items: vec![product_item("SW1001", Some("Trail Shoe"))],
            payment_method: None,
            billing,
            shipping: Some(shipping),
        };

        tracker.checkout_finished(&order).await;

        let ctx = tracker.take_context().unwrap();
        assert_eq!(ctx.commerce.different_address.as_deref(), Some("billing == shipping"));
        assert_eq!(ctx.commerce.country_shipping.as_deref(), Some(UNKNOWN));
    }

    #[tokio::test]
    async fn test_checkout_without_line_items_is_skipped() {
        let (tracker, _session) = tracker_with_session().await;

        let order = CompletedOrder {
            id: "order-3".to_string(),
            order_number: "10079".to_string(),
            amount_total: 0.0,
            amount_net: 0.0,
            tax_amount: 0.0,
            shipping_total: 0.0,
            line_items: vec![],
            payment_method: None,
            billing: OrderAddress::default(),
            shipping: None,
        };

        tracker.checkout_finished(&order).await;

        let ctx = tracker.take_context().unwrap();
        assert_eq!(ctx.commerce.order_number, None);
        assert_eq!(ctx.order_id, None);
    }

    #[tokio::test]
    async fn test_context_is_taken_at_most_once() {
        let (tracker, _session) = tracker_with_session().await;
        assert!(tracker.take_context().is_some());
        assert!(tracker.take_context().is_none());
    }
}
