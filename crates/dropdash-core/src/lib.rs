//! Core domain model for the dropship dashboard.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dropdash-core";

/// Number of fractional digits kept for every monetary amount.
pub const MONEY_SCALE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{field}`")]
    Missing { field: &'static str },
    #[error("field `{field}` must not be negative (got {value})")]
    Negative { field: &'static str, value: Decimal },
    #[error("field `{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}

/// Authenticated caller identity, passed explicitly into every owner-scoped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(pub Uuid);

impl CallerId {
    pub fn user_id(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for CallerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Rounds to cents, half away from zero.
pub fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Validates a non-negative monetary amount and normalizes it to cents.
pub fn non_negative_money(field: &'static str, value: Decimal) -> Result<Decimal, ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(money(value))
}

/// Parses a decimal string (as sent by e-commerce APIs) into a validated amount.
pub fn parse_money(field: &'static str, raw: &str) -> Result<Decimal, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Missing { field });
    }
    let value = trimmed
        .parse::<Decimal>()
        .map_err(|err| ValidationError::Malformed {
            field,
            reason: err.to_string(),
        })?;
    non_negative_money(field, value)
}

/// Reduces a store URL or bare shop domain to its lower-cased host.
///
/// `https://Shop.example.com/` and `shop.example.com` both yield `shop.example.com`.
pub fn normalize_store_domain(input: &str) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if host.is_empty() {
        return Err(ValidationError::Missing { field: "store_domain" });
    }
    if host
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':')))
    {
        return Err(ValidationError::Malformed {
            field: "store_domain",
            reason: format!("`{host}` is not a valid host"),
        });
    }
    Ok(host)
}

/// Canonical stored form of a store URL: `https://{host}`.
pub fn canonical_store_url(input: &str) -> Result<String, ValidationError> {
    Ok(format!("https://{}", normalize_store_domain(input)?))
}

fn required_text(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Missing { field });
    }
    Ok(trimmed.to_string())
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub product_cost: Decimal,
    pub store_url: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub is_visible: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn is_owned_by(&self, caller: CallerId) -> bool {
        self.user_id == caller.user_id()
    }

    /// Store credentials, present only when both URL and token are configured.
    pub fn store_credentials(&self) -> Option<StoreCredentials> {
        let store_url = self.store_url.as_deref().filter(|v| !v.trim().is_empty())?;
        let access_token = self.access_token.as_deref().filter(|v| !v.trim().is_empty())?;
        Some(StoreCredentials {
            store_url: store_url.to_string(),
            access_token: access_token.to_string(),
        })
    }

    pub fn has_store_connection(&self) -> bool {
        self.store_credentials().is_some()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct StoreCredentials {
    pub store_url: String,
    pub access_token: String,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("store_url", &self.store_url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub product_id: Uuid,
    pub external_order_id: Option<String>,
    pub order_date: DateTime<Utc>,
    pub revenue: Decimal,
    pub cost: Decimal,
    pub customer_email: Option<String>,
    pub order_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn profit(&self) -> Decimal {
        self.revenue - self.cost
    }

    /// Calendar day the order is bucketed under (UTC).
    pub fn order_day(&self) -> NaiveDate {
        self.order_date.date_naive()
    }

    pub fn is_external(&self) -> bool {
        self.external_order_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: Uuid,
    pub product_id: Uuid,
    pub description: String,
    pub amount: Decimal,
    pub expense_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Product form input. Also used as the full-replacement update body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDraft {
    pub name: String,
    pub product_cost: Decimal,
    #[serde(default)]
    pub store_url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
}

fn default_visible() -> bool {
    true
}

impl ProductDraft {
    pub fn validate(self) -> Result<Self, ValidationError> {
        let store_url = optional_text(self.store_url)
            .map(|url| canonical_store_url(&url))
            .transpose()?;
        Ok(Self {
            name: required_text("name", &self.name)?,
            product_cost: non_negative_money("product_cost", self.product_cost)?,
            store_url,
            access_token: optional_text(self.access_token),
            is_visible: self.is_visible,
        })
    }
}

/// Order ready to persist for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub product_id: Uuid,
    #[serde(default)]
    pub external_order_id: Option<String>,
    pub order_date: DateTime<Utc>,
    pub revenue: Decimal,
    pub cost: Decimal,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub order_number: Option<String>,
}

impl NewOrder {
    pub fn validate(self) -> Result<Self, ValidationError> {
        Ok(Self {
            product_id: self.product_id,
            external_order_id: optional_text(self.external_order_id),
            order_date: self.order_date,
            revenue: non_negative_money("revenue", self.revenue)?,
            cost: non_negative_money("cost", self.cost)?,
            customer_email: optional_text(self.customer_email),
            order_number: optional_text(self.order_number),
        })
    }
}

/// Editable order fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub order_date: DateTime<Utc>,
    pub revenue: Decimal,
    pub cost: Decimal,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub order_number: Option<String>,
}

impl OrderUpdate {
    pub fn validate(self) -> Result<Self, ValidationError> {
        Ok(Self {
            order_date: self.order_date,
            revenue: non_negative_money("revenue", self.revenue)?,
            cost: non_negative_money("cost", self.cost)?,
            customer_email: optional_text(self.customer_email),
            order_number: optional_text(self.order_number),
        })
    }
}

/// Expense form input. Also used as the full-replacement update body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseDraft {
    pub description: String,
    pub amount: Decimal,
    pub expense_date: NaiveDate,
}

impl ExpenseDraft {
    pub fn validate(self) -> Result<Self, ValidationError> {
        Ok(Self {
            description: required_text("description", &self.description)?,
            amount: non_negative_money("amount", self.amount)?,
            expense_date: self.expense_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(units: i64, scale: u32) -> Decimal {
        Decimal::new(units, scale)
    }

    #[test]
    fn money_rounds_half_away_from_zero() {
        assert_eq!(money(dec(10005, 3)), dec(1001, 2));
        assert_eq!(money(dec(10004, 3)), dec(1000, 2));
    }

    #[test]
    fn parse_money_rejects_missing_and_negative_values() {
        assert_eq!(
            parse_money("total_price", "  "),
            Err(ValidationError::Missing { field: "total_price" })
        );
        assert!(matches!(
            parse_money("total_price", "-1.00"),
            Err(ValidationError::Negative { .. })
        ));
        assert!(matches!(
            parse_money("total_price", "abc"),
            Err(ValidationError::Malformed { .. })
        ));
        assert_eq!(parse_money("total_price", "19.999").unwrap(), dec(2000, 2));
    }

    #[test]
    fn store_domains_normalize_to_host() {
        assert_eq!(
            normalize_store_domain("https://My-Shop.myshopify.com/").unwrap(),
            "my-shop.myshopify.com"
        );
        assert_eq!(
            normalize_store_domain("my-shop.myshopify.com").unwrap(),
            "my-shop.myshopify.com"
        );
        assert_eq!(
            canonical_store_url("http://my-shop.myshopify.com/admin").unwrap(),
            "https://my-shop.myshopify.com"
        );
        assert!(normalize_store_domain("https://").is_err());
        assert!(normalize_store_domain("bad host.com").is_err());
    }

    #[test]
    fn product_draft_validation_normalizes_store_url_and_cost() {
        let draft = ProductDraft {
            name: "  Posture corrector ".into(),
            product_cost: dec(7499, 3),
            store_url: Some("Shop.example.com/".into()),
            access_token: Some("  ".into()),
            is_visible: true,
        }
        .validate()
        .unwrap();
        assert_eq!(draft.name, "Posture corrector");
        assert_eq!(draft.product_cost, dec(750, 2));
        assert_eq!(draft.store_url.as_deref(), Some("https://shop.example.com"));
        assert_eq!(draft.access_token, None);
    }

    #[test]
    fn product_draft_rejects_negative_cost_and_blank_name() {
        let base = ProductDraft {
            name: "Lamp".into(),
            product_cost: dec(-1, 0),
            store_url: None,
            access_token: None,
            is_visible: true,
        };
        assert!(matches!(
            base.clone().validate(),
            Err(ValidationError::Negative { field: "product_cost", .. })
        ));
        let blank = ProductDraft {
            name: " ".into(),
            product_cost: Decimal::ZERO,
            ..base
        };
        assert_eq!(
            blank.validate(),
            Err(ValidationError::Missing { field: "name" })
        );
    }

    #[test]
    fn order_json_without_revenue_is_rejected() {
        let body = serde_json::json!({
            "productId": Uuid::nil(),
            "orderDate": "2026-03-01T10:00:00Z",
            "cost": "4.00"
        });
        assert!(serde_json::from_value::<NewOrder>(body).is_err());
    }

    #[test]
    fn credentials_require_url_and_token() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let mut product = Product {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Lamp".into(),
            product_cost: dec(500, 2),
            store_url: Some("https://shop.example.com".into()),
            access_token: None,
            is_visible: true,
            created_at: now,
            updated_at: now,
        };
        assert!(!product.has_store_connection());
        product.access_token = Some("shpat_123".into());
        let creds = product.store_credentials().unwrap();
        assert_eq!(creds.store_url, "https://shop.example.com");
        assert!(!format!("{creds:?}").contains("shpat_123"));
    }
}
