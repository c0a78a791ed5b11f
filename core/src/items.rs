//! Line item modifiers. Every write first consolidates the user's active cart
//! inside the same transaction.

use anyhow::Result;

use crate::consolidation::{consolidate_existing, consolidate_in};
use crate::db::Database;
use crate::models::{
    CartDetails, CartError, CartItem, CartLine, CartPolicy, LineOutcome, Product,
    QuantityAdjustment, line_total_cents, total_cents, validate_user_id,
};
use crate::stock::{StockCheck, check_stock, clamp_quantity};

/// Reject products that cannot take any units at all.
fn ensure_orderable(product: &Product, policy: &CartPolicy) -> Result<()> {
    match check_stock(product, 1, policy) {
        StockCheck::Unavailable => Err(CartError::ProductUnavailable(product.id).into()),
        StockCheck::OutOfStock => Err(CartError::OutOfStock(product.id).into()),
        StockCheck::Available | StockCheck::Limited { .. } => Ok(()),
    }
}

fn load_product(db: &Database, product_id: i64) -> Result<Product> {
    db.get_product(product_id)?
        .ok_or_else(|| CartError::ProductNotFound(product_id).into())
}

/// Add `quantity` units of a product to the user's active cart.
///
/// An existing line is incremented, otherwise a new line is written with the
/// current price as its snapshot. The resulting quantity is capped at stock
/// and at the policy maximum; a cap is reported, not treated as an error.
pub fn add_item(
    db: &Database,
    user_id: &str,
    product_id: i64,
    quantity: i64,
    policy: &CartPolicy,
) -> Result<LineOutcome> {
    if quantity < 1 {
        return Err(CartError::InvalidQuantity(quantity).into());
    }
    let user_id = validate_user_id(user_id)?;

    let tx = db.immediate_transaction()?;
    let cart = consolidate_in(db, &user_id, policy)?.cart;
    let product = load_product(db, product_id)?;
    ensure_orderable(&product, policy)?;

    let existing = db.find_cart_item(cart.id, product_id)?;
    let current = existing.as_ref().map_or(0, |item| item.quantity);
    let requested = current.saturating_add(quantity);
    let (applied, adjustment) = clamp_quantity(&product, requested, policy);

    let item = match existing {
        Some(item) if item.quantity == applied => item,
        Some(item) => db.set_cart_item_quantity(item.id, applied)?,
        None => db.insert_cart_item(cart.id, product.id, applied, product.price_cents)?,
    };
    db.touch_cart(cart.id)?;
    tx.commit()?;

    if let Some(adj) = &adjustment {
        tracing::info!(
            user_id = %user_id,
            product_id,
            requested = adj.requested,
            applied = adj.applied,
            reason = ?adj.reason,
            "capped cart quantity"
        );
    }

    Ok(LineOutcome {
        item,
        requested,
        capped: adjustment.is_some(),
        adjustment,
    })
}

/// Set the quantity of a line already in the cart. Zero removes the line and
/// returns `None`.
pub fn set_item_quantity(
    db: &Database,
    user_id: &str,
    product_id: i64,
    quantity: i64,
    policy: &CartPolicy,
) -> Result<Option<LineOutcome>> {
    if quantity < 0 {
        return Err(CartError::InvalidQuantity(quantity).into());
    }
    let user_id = validate_user_id(user_id)?;

    let tx = db.immediate_transaction()?;
    let cart = consolidate_in(db, &user_id, policy)?.cart;
    let item = db
        .find_cart_item(cart.id, product_id)?
        .ok_or(CartError::ItemNotInCart(product_id))?;

    if quantity == 0 {
        db.delete_cart_item(item.id)?;
        db.touch_cart(cart.id)?;
        tx.commit()?;
        return Ok(None);
    }

    let product = load_product(db, product_id)?;
    ensure_orderable(&product, policy)?;
    let (applied, adjustment) = clamp_quantity(&product, quantity, policy);
    let item = if applied == item.quantity {
        item
    } else {
        db.set_cart_item_quantity(item.id, applied)?
    };
    db.touch_cart(cart.id)?;
    tx.commit()?;

    Ok(Some(LineOutcome {
        item,
        requested: quantity,
        capped: adjustment.is_some(),
        adjustment,
    }))
}

/// Remove a product's line from the user's cart. Returns whether a line existed.
pub fn remove_item(
    db: &Database,
    user_id: &str,
    product_id: i64,
    policy: &CartPolicy,
) -> Result<bool> {
    let user_id = validate_user_id(user_id)?;

    let tx = db.immediate_transaction()?;
    let Some(report) = consolidate_existing(db, &user_id, policy)? else {
        return Ok(false);
    };
    let removed = match db.find_cart_item(report.cart.id, product_id)? {
        Some(item) => db.delete_cart_item(item.id)?,
        None => false,
    };
    if removed {
        db.touch_cart(report.cart.id)?;
    }
    tx.commit()?;
    Ok(removed)
}

/// Remove every line from the user's active cart, returning how many were removed.
pub fn clear_cart(db: &Database, user_id: &str, policy: &CartPolicy) -> Result<usize> {
    let user_id = validate_user_id(user_id)?;

    let tx = db.immediate_transaction()?;
    let Some(report) = consolidate_existing(db, &user_id, policy)? else {
        return Ok(0);
    };
    let removed = db.delete_cart_items(report.cart.id)?;
    db.touch_cart(report.cart.id)?;
    tx.commit()?;
    Ok(removed)
}

/// Bring every line of a cart back within live stock and the policy maximum.
///
/// Lines whose product is gone, inactive or out of stock are dropped; lines
/// above the cap are lowered. Returns the remaining lines with their products,
/// plus one adjustment per line that changed.
pub(crate) fn reconcile_cart(
    db: &Database,
    cart_id: i64,
    policy: &CartPolicy,
) -> Result<(Vec<(CartItem, Product)>, Vec<QuantityAdjustment>)> {
    let mut kept = Vec::new();
    let mut adjustments = Vec::new();
    for item in db.cart_items(cart_id)? {
        let Some(product) = db.get_product(item.product_id)? else {
            db.delete_cart_item(item.id)?;
            continue;
        };
        let (applied, adjustment) = clamp_quantity(&product, item.quantity, policy);
        let Some(adjustment) = adjustment else {
            kept.push((item, product));
            continue;
        };
        if applied == 0 {
            tracing::warn!(
                cart_id,
                product_id = product.id,
                reason = ?adjustment.reason,
                "dropped cart line"
            );
            db.delete_cart_item(item.id)?;
        } else {
            let item = db.set_cart_item_quantity(item.id, applied)?;
            kept.push((item, product));
        }
        adjustments.push(adjustment);
    }
    Ok((kept, adjustments))
}

/// Reconciled view of the user's active cart with prices and totals.
pub fn cart_details(db: &Database, user_id: &str, policy: &CartPolicy) -> Result<CartDetails> {
    let user_id = validate_user_id(user_id)?;

    let tx = db.immediate_transaction()?;
    let Some(report) = consolidate_existing(db, &user_id, policy)? else {
        return Ok(CartDetails {
            cart_id: None,
            user_id,
            lines: Vec::new(),
            total_items: 0,
            total_cents: 0,
            updated_at: None,
            adjustments: Vec::new(),
        });
    };

    let (kept, reconciled) = reconcile_cart(db, report.cart.id, policy)?;
    let mut adjustments = report.adjustments;
    adjustments.extend(reconciled);

    let updated_at = if adjustments.is_empty() {
        report.cart.updated_at.clone()
    } else {
        db.touch_cart(report.cart.id)?
    };
    tx.commit()?;

    let lines = kept
        .into_iter()
        .map(|(item, product)| {
            Ok(CartLine {
                item_id: item.id,
                product_id: product.id,
                sku: product.sku,
                name: product.name,
                quantity: item.quantity,
                unit_price_cents: item.unit_price_cents,
                current_price_cents: product.price_cents,
                line_total_cents: line_total_cents(item.quantity, item.unit_price_cents)?,
            })
        })
        .collect::<Result<Vec<CartLine>, CartError>>()?;
    let total_cents = total_cents(lines.iter().map(|l| (l.quantity, l.unit_price_cents)))?;

    Ok(CartDetails {
        cart_id: Some(report.cart.id),
        user_id,
        total_items: lines.iter().map(|l| l.quantity).sum(),
        total_cents,
        lines,
        updated_at: Some(updated_at),
        adjustments,
    })
}
