use anyhow::Result;
use serde::Serialize;

use crate::db::Database;
use crate::models::{AdjustmentReason, CartError, CartPolicy, Product, QuantityAdjustment};

/// Outcome of checking a requested quantity against live inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StockCheck {
    Available,
    /// Only `available` units can go into the cart.
    Limited { available: i64 },
    OutOfStock,
    Unavailable,
}

impl StockCheck {
    pub fn is_available(self) -> bool {
        matches!(self, Self::Available)
    }
}

/// The quantity that may be committed for a line: `min(requested, stock, max)`,
/// never negative.
pub fn allowed_quantity(requested: i64, stock: i64, max_item_quantity: i64) -> i64 {
    requested.min(stock).min(max_item_quantity).max(0)
}

pub fn check_stock(product: &Product, requested: i64, policy: &CartPolicy) -> StockCheck {
    if !product.active {
        return StockCheck::Unavailable;
    }
    if product.stock <= 0 {
        return StockCheck::OutOfStock;
    }
    let allowed = allowed_quantity(requested, product.stock, policy.max_item_quantity);
    if allowed < requested {
        StockCheck::Limited { available: allowed }
    } else {
        StockCheck::Available
    }
}

/// Look the product up and check it. Unknown products are a `CartError`.
pub fn lookup_stock(
    db: &Database,
    product_id: i64,
    requested: i64,
    policy: &CartPolicy,
) -> Result<StockCheck> {
    if requested < 1 {
        return Err(CartError::InvalidQuantity(requested).into());
    }
    let product = db
        .get_product(product_id)?
        .ok_or(CartError::ProductNotFound(product_id))?;
    Ok(check_stock(&product, requested, policy))
}

/// Clamp `requested` for `product`, describing any reduction.
///
/// `applied` of zero means the line must not exist.
pub(crate) fn clamp_quantity(
    product: &Product,
    requested: i64,
    policy: &CartPolicy,
) -> (i64, Option<QuantityAdjustment>) {
    let adjust = |applied: i64, reason: AdjustmentReason| {
        (
            applied,
            Some(QuantityAdjustment {
                product_id: product.id,
                requested,
                applied,
                reason,
            }),
        )
    };

    if !product.active {
        return adjust(0, AdjustmentReason::Unavailable);
    }
    if product.stock <= 0 {
        return adjust(0, AdjustmentReason::OutOfStock);
    }
    let applied = allowed_quantity(requested, product.stock, policy.max_item_quantity);
    if applied >= requested {
        (requested, None)
    } else if product.stock < policy.max_item_quantity.min(requested) {
        adjust(applied, AdjustmentReason::StockLimit)
    } else {
        adjust(applied, AdjustmentReason::MaxQuantity)
    }
}
