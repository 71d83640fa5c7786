//! External order sources: the Shopify-style REST client, its wire types and the
//! per-order cost policy shared by webhook ingestion and pull sync.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use dropdash_core::{
    money, normalize_store_domain, parse_money, NewOrder, StoreCredentials, ValidationError,
};
use hmac::{Hmac, Mac};
use reqwest::Url;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dropdash-adapters";

pub const DEFAULT_API_VERSION: &str = "2024-01";
pub const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
pub const SHOP_DOMAIN_HEADER: &str = "X-Shopify-Shop-Domain";
pub const HMAC_HEADER: &str = "X-Shopify-Hmac-Sha256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode order payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid store url: {0}")]
    InvalidStore(#[source] ValidationError),
    #[error("order {id}: {source}")]
    InvalidOrder {
        id: String,
        #[source]
        source: ValidationError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default = "one")]
    pub quantity: u32,
}

fn one() -> u32 {
    1
}

/// An order as the store platform reports it, both in list responses and in
/// `orders/create` webhook bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalOrder {
    #[serde(deserialize_with = "external_id")]
    pub id: String,
    #[serde(default)]
    pub order_number: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub total_price: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

/// Webhook bodies carry the same order document as the list endpoint.
pub type WebhookOrderPayload = ExternalOrder;

fn external_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(n) => Ok(n.to_string()),
        RawId::Text(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        RawId::Text(_) => Err(serde::de::Error::custom("order id is empty")),
    }
}

#[derive(Debug, Deserialize)]
struct OrdersEnvelope {
    #[serde(default)]
    orders: Vec<ExternalOrder>,
}

impl ExternalOrder {
    /// Sum of line-item quantities; an order without line items counts as one unit.
    pub fn total_quantity(&self) -> u32 {
        let total = self
            .line_items
            .iter()
            .fold(0u32, |acc, item| acc.saturating_add(item.quantity));
        if total == 0 {
            1
        } else {
            total
        }
    }

    pub fn revenue(&self) -> Result<Decimal, SourceError> {
        let raw = self.total_price.as_deref().unwrap_or_default();
        parse_money("total_price", raw).map_err(|source| SourceError::InvalidOrder {
            id: self.id.clone(),
            source,
        })
    }

    /// `#1001` built from the numeric order number.
    pub fn numbered_label(&self) -> Option<String> {
        self.order_number.map(|n| format!("#{n}"))
    }

    /// The platform's display name, falling back to the numbered label.
    pub fn display_label(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| self.numbered_label())
    }

    /// Maps the order onto a row for `product_id`, costing it with [`order_cost`].
    pub fn to_new_order(
        &self,
        product_id: Uuid,
        unit_cost: Decimal,
        order_number: Option<String>,
    ) -> Result<NewOrder, SourceError> {
        let order = NewOrder {
            product_id,
            external_order_id: Some(self.id.clone()),
            order_date: self.created_at,
            revenue: self.revenue()?,
            cost: order_cost(unit_cost, self.total_quantity()),
            customer_email: self.email.clone(),
            order_number,
        };
        order.validate().map_err(|source| SourceError::InvalidOrder {
            id: self.id.clone(),
            source,
        })
    }
}

/// Cost of an order: per-unit cost times units sold.
pub fn order_cost(unit_cost: Decimal, quantity: u32) -> Decimal {
    money(unit_cost * Decimal::from(quantity))
}

/// Checks the base64 HMAC-SHA256 of the raw webhook body.
pub fn verify_webhook_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(expected) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign_webhook_body(secret: &[u8], body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(BASE64.encode(mac.finalize().into_bytes()))
}

/// Decodes an `{"orders": [...]}` listing body.
pub fn parse_orders_response(body: &[u8]) -> Result<Vec<ExternalOrder>, SourceError> {
    let envelope: OrdersEnvelope = serde_json::from_slice(body)?;
    Ok(envelope.orders)
}

/// Orders listing URL for a store, optionally bounded below by `since`.
pub fn orders_url(
    store_url: &str,
    api_version: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Url, SourceError> {
    let host = normalize_store_domain(store_url).map_err(SourceError::InvalidStore)?;
    let base = format!("https://{host}/admin/api/{api_version}/orders.json");
    let mut params = vec![("status", "any".to_string())];
    if let Some(since) = since {
        params.push((
            "created_at_min",
            since.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
    }
    Url::parse_with_params(&base, &params).map_err(|err| {
        SourceError::InvalidStore(ValidationError::Malformed {
            field: "store_url",
            reason: err.to_string(),
        })
    })
}

#[async_trait]
pub trait OrderSource: Send + Sync {
    /// All orders created at or after `since`, or the full history when `since` is `None`.
    async fn fetch_orders(
        &self,
        credentials: &StoreCredentials,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalOrder>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub api_version: String,
}

impl Default for ShopifyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShopifyOrderSource {
    client: reqwest::Client,
    api_version: String,
}

impl ShopifyOrderSource {
    pub fn new(config: ShopifyConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            api_version: config.api_version,
        })
    }
}

#[async_trait]
impl OrderSource for ShopifyOrderSource {
    async fn fetch_orders(
        &self,
        credentials: &StoreCredentials,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalOrder>, SourceError> {
        let url = orders_url(&credentials.store_url, &self.api_version, since)?;
        let span = info_span!("shopify_fetch", store = %credentials.store_url, since = ?since);

        async {
            let resp = self
                .client
                .get(url.clone())
                .header(ACCESS_TOKEN_HEADER, &credentials.access_token)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(SourceError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let orders = parse_orders_response(&resp.bytes().await?)?;
            debug!(count = orders.len(), "fetched orders");
            Ok(orders)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order_json(line_items: &str) -> String {
        format!(
            r##"{{"id": 450789469, "order_number": 1001, "name": "#1001",
                "email": "buyer@example.com", "created_at": "2026-03-01T10:00:00-05:00",
                "total_price": "59.90", "line_items": {line_items}}}"##
        )
    }

    #[test]
    fn cost_multiplies_unit_cost_by_total_quantity() {
        let order: ExternalOrder =
            serde_json::from_str(&order_json(r#"[{"price": "20.00", "quantity": 2}, {"price": "5.00", "quantity": 3}]"#))
                .unwrap();
        assert_eq!(order.total_quantity(), 5);
        let row = order
            .to_new_order(Uuid::nil(), Decimal::new(1000, 2), order.numbered_label())
            .unwrap();
        assert_eq!(row.cost, Decimal::new(5000, 2));
        assert_eq!(row.revenue, Decimal::new(5990, 2));
        assert_eq!(row.external_order_id.as_deref(), Some("450789469"));
        assert_eq!(row.order_number.as_deref(), Some("#1001"));
        assert_eq!(
            row.order_date,
            Utc.with_ymd_and_hms(2026, 3, 1, 15, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn order_without_line_items_counts_one_unit() {
        let order: ExternalOrder = serde_json::from_str(&order_json("[]")).unwrap();
        assert_eq!(order.total_quantity(), 1);
        assert_eq!(order_cost(Decimal::new(1250, 2), order.total_quantity()), Decimal::new(1250, 2));
    }

    #[test]
    fn missing_total_price_is_rejected() {
        let order: ExternalOrder = serde_json::from_str(
            r#"{"id": "A-1", "created_at": "2026-03-01T10:00:00Z"}"#,
        )
        .unwrap();
        let err = order
            .to_new_order(Uuid::nil(), Decimal::ONE, None)
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::InvalidOrder {
                source: ValidationError::Missing { field: "total_price" },
                ..
            }
        ));
    }

    #[test]
    fn display_label_prefers_name() {
        let mut order: ExternalOrder = serde_json::from_str(&order_json("[]")).unwrap();
        order.name = Some("SHOP-77".into());
        assert_eq!(order.display_label().as_deref(), Some("SHOP-77"));
        order.name = None;
        assert_eq!(order.display_label().as_deref(), Some("#1001"));
    }

    #[test]
    fn orders_url_includes_cursor_only_when_present() {
        let url = orders_url("https://Shop.Example.com/admin", "2024-01", None).unwrap();
        assert_eq!(
            url.as_str(),
            "https://shop.example.com/admin/api/2024-01/orders.json?status=any"
        );

        let since = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let url = orders_url("shop.example.com", "2024-01", Some(since)).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("status".to_string(), "any".to_string()),
                ("created_at_min".to_string(), "2026-03-01T12:00:00Z".to_string()),
            ]
        );
    }

    #[test]
    fn signature_round_trip_and_tamper() {
        let secret = b"hush";
        let body = br#"{"id": 1}"#;
        let signature = sign_webhook_body(secret, body).unwrap();
        assert!(verify_webhook_signature(secret, body, &signature));
        assert!(!verify_webhook_signature(secret, br#"{"id": 2}"#, &signature));
        assert!(!verify_webhook_signature(b"other", body, &signature));
        assert!(!verify_webhook_signature(secret, body, "not base64!"));
        assert!(!verify_webhook_signature(secret, body, ""));
    }
}
