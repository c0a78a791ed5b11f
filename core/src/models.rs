use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on the quantity of a single line item.
pub const DEFAULT_MAX_ITEM_QUANTITY: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    #[serde(default)]
    pub uuid: String,
    pub sku: Option<String>,
    pub name: String,
    pub price_cents: i64,
    pub stock: i64,
    pub active: bool,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub sku: Option<String>,
    pub name: String,
    pub price_cents: i64,
    pub stock: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CartStatus {
    Active,
    Merged,
    Archived,
}

impl CartStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for CartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CartStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "merged" => Ok(Self::Merged),
            "archived" => Ok(Self::Archived),
            _ => bail!("Invalid cart status '{s}'. Must be one of: active, merged, archived"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Cart {
    pub id: i64,
    pub uuid: String,
    pub user_id: String,
    pub status: CartStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartItem {
    pub id: i64,
    pub cart_id: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub added_at: String,
    pub updated_at: String,
}

/// Why a line item ended up with fewer units than were asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    /// Capped at the product's available stock.
    StockLimit,
    /// Capped at the per-line maximum.
    MaxQuantity,
    /// The product has no stock left, the row was dropped.
    OutOfStock,
    /// The product was deactivated, the row was dropped.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuantityAdjustment {
    pub product_id: i64,
    pub requested: i64,
    pub applied: i64,
    pub reason: AdjustmentReason,
}

/// Result of restoring the single-active-cart invariant for one user.
#[derive(Debug, Clone, Serialize)]
pub struct Consolidation {
    pub cart: Cart,
    pub created: bool,
    pub merged_cart_ids: Vec<i64>,
    pub adjustments: Vec<QuantityAdjustment>,
}

/// Result of writing a line item: what ended up in the cart and whether a cap applied.
#[derive(Debug, Clone, Serialize)]
pub struct LineOutcome {
    pub item: CartItem,
    /// Quantity the line would have had without any cap.
    pub requested: i64,
    pub capped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<QuantityAdjustment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub item_id: i64,
    pub product_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub current_price_cents: i64,
    pub line_total_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartDetails {
    /// `None` when the user has no active cart yet.
    pub cart_id: Option<i64>,
    pub user_id: String,
    pub lines: Vec<CartLine>,
    pub total_items: i64,
    pub total_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub adjustments: Vec<QuantityAdjustment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub uuid: String,
    pub user_id: String,
    pub cart_id: i64,
    pub total_cents: i64,
    pub created_at: String,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderItem {
    pub product_id: i64,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

impl OrderItem {
    pub fn line_total_cents(&self) -> Result<i64, CartError> {
        line_total_cents(self.quantity, self.unit_price_cents)
    }
}

pub fn line_total_cents(quantity: i64, unit_price_cents: i64) -> Result<i64, CartError> {
    quantity
        .checked_mul(unit_price_cents)
        .ok_or(CartError::TotalTooLarge)
}

/// Sum `quantity * unit_price_cents` over `(quantity, unit_price_cents)` pairs.
pub fn total_cents<I>(lines: I) -> Result<i64, CartError>
where
    I: IntoIterator<Item = (i64, i64)>,
{
    lines.into_iter().try_fold(0i64, |acc, (quantity, unit)| {
        acc.checked_add(line_total_cents(quantity, unit)?)
            .ok_or(CartError::TotalTooLarge)
    })
}

/// Limits applied to every cart write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartPolicy {
    pub max_item_quantity: i64,
}

impl Default for CartPolicy {
    fn default() -> Self {
        Self {
            max_item_quantity: DEFAULT_MAX_ITEM_QUANTITY,
        }
    }
}

impl CartPolicy {
    pub fn new(max_item_quantity: i64) -> Result<Self> {
        if max_item_quantity < 1 {
            bail!("max_item_quantity must be at least 1 (got {max_item_quantity})");
        }
        Ok(Self { max_item_quantity })
    }
}

/// Domain failures surfaced to callers. Carried inside `anyhow::Error`;
/// frontends recover the variant with `downcast_ref`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CartError {
    #[error("Invalid quantity {0}")]
    InvalidQuantity(i64),
    #[error("Product {0} not found")]
    ProductNotFound(i64),
    #[error("Product {0} is not available")]
    ProductUnavailable(i64),
    #[error("Product {0} is out of stock")]
    OutOfStock(i64),
    #[error("Only {available} of '{name}' in stock (requested {requested})")]
    InsufficientStock {
        product_id: i64,
        name: String,
        requested: i64,
        available: i64,
    },
    #[error("Product {0} is not in the cart")]
    ItemNotInCart(i64),
    #[error("Cart is empty")]
    EmptyCart,
    #[error("Order {0} not found")]
    OrderNotFound(i64),
    #[error("Cart total is too large")]
    TotalTooLarge,
}

/// Validate a new product: name must not be empty, price and stock must not be negative.
pub fn validate_new_product(product: &NewProduct) -> Result<()> {
    if product.name.trim().is_empty() {
        bail!("Product name must not be empty");
    }
    if product.price_cents < 0 {
        bail!("price must not be negative");
    }
    if product.stock < 0 {
        bail!("stock must not be negative");
    }
    if product.sku.as_deref().is_some_and(|s| s.trim().is_empty()) {
        bail!("sku must not be blank");
    }
    Ok(())
}

/// Validate a user or guest identifier used as a cart owner.
pub fn validate_user_id(user_id: &str) -> Result<String> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        bail!("User id must not be empty");
    }
    if trimmed.len() > 128 {
        bail!("User id must be at most 128 characters");
    }
    Ok(trimmed.to_string())
}

/// Parse a decimal currency amount ("12", "12.5", "12.50") into cents.
pub fn parse_price_cents(s: &str) -> Result<i64> {
    let s = s.trim().trim_start_matches('$');
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        bail!("Invalid price: '{s}'");
    }
    if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid price: '{s}'. Use at most two decimal places");
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid price: '{s}'");
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse()? };
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>()? * 10,
        _ => frac.parse()?,
    };
    whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac))
        .ok_or_else(|| anyhow::anyhow!("Price too large: '{s}'"))
}

/// Format cents as a decimal amount, e.g. `1250` -> `"12.50"`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_price_cents() {
        assert_eq!(parse_price_cents("12").unwrap(), 1200);
        assert_eq!(parse_price_cents("12.5").unwrap(), 1250);
        assert_eq!(parse_price_cents("12.05").unwrap(), 1205);
        assert_eq!(parse_price_cents("$0.99").unwrap(), 99);
        assert_eq!(parse_price_cents(".5").unwrap(), 50);
        assert!(parse_price_cents("12.345").is_err());
        assert!(parse_price_cents("-1").is_err());
        assert!(parse_price_cents("abc").is_err());
        assert!(parse_price_cents("").is_err());
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(1250), "12.50");
        assert_eq!(format_cents(-199), "-1.99");
    }

    #[test]
    fn test_total_cents_overflow() {
        assert_eq!(total_cents([(2, 800), (3, 150)]), Ok(2050));
        assert_eq!(total_cents([]), Ok(0));
        assert_eq!(
            line_total_cents(2, i64::MAX / 2 + 1),
            Err(CartError::TotalTooLarge)
        );
        assert_eq!(
            total_cents([(1, i64::MAX), (1, 1)]),
            Err(CartError::TotalTooLarge)
        );
    }

    #[test]
    fn test_cart_status_roundtrip_strings() {
        for status in [CartStatus::Active, CartStatus::Merged, CartStatus::Archived] {
            assert_eq!(status.as_str().parse::<CartStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<CartStatus>().is_err());
    }

    #[test]
    fn test_validate_user_id() {
        assert_eq!(validate_user_id("  alice ").unwrap(), "alice");
        assert!(validate_user_id("   ").is_err());
        assert!(validate_user_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_new_product() {
        let ok = NewProduct {
            sku: Some("MUG-1".to_string()),
            name: "Mug".to_string(),
            price_cents: 800,
            stock: 3,
        };
        assert!(validate_new_product(&ok).is_ok());
        assert!(
            validate_new_product(&NewProduct {
                name: " ".to_string(),
                ..ok.clone()
            })
            .is_err()
        );
        assert!(
            validate_new_product(&NewProduct {
                stock: -1,
                ..ok.clone()
            })
            .is_err()
        );
        assert!(
            validate_new_product(&NewProduct {
                sku: Some(String::new()),
                ..ok
            })
            .is_err()
        );
    }

    #[test]
    fn test_cart_policy_rejects_zero() {
        assert!(CartPolicy::new(0).is_err());
        assert_eq!(CartPolicy::new(3).unwrap().max_item_quantity, 3);
        assert_eq!(
            CartPolicy::default().max_item_quantity,
            DEFAULT_MAX_ITEM_QUANTITY
        );
    }
}
