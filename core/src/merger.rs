use anyhow::{Result, ensure};

use crate::consolidation::consolidate_in;
use crate::db::Database;
use crate::models::{
    Cart, CartPolicy, CartStatus, Consolidation, QuantityAdjustment, validate_user_id,
};
use crate::stock::clamp_quantity;

/// Move every line of `source` into `target`, then retire `source` with `status`.
///
/// Lines for a product already in `target` are summed into the target row,
/// which keeps its own price snapshot. Every resulting quantity is capped at
/// live stock and the policy maximum; a line capped to zero is dropped.
///
/// Must run inside a transaction opened by the caller.
pub fn merge_cart_into(
    db: &Database,
    source: &Cart,
    target: &Cart,
    policy: &CartPolicy,
    status: CartStatus,
) -> Result<Vec<QuantityAdjustment>> {
    ensure!(source.id != target.id, "Cannot merge cart {} into itself", source.id);
    ensure!(
        status != CartStatus::Active,
        "A merged cart cannot stay active"
    );

    let mut adjustments = Vec::new();
    let mut moved = 0usize;
    let mut summed = 0usize;

    for item in db.cart_items(source.id)? {
        let Some(product) = db.get_product(item.product_id)? else {
            db.delete_cart_item(item.id)?;
            continue;
        };

        if let Some(existing) = db.find_cart_item(target.id, item.product_id)? {
            let requested = existing.quantity.saturating_add(item.quantity);
            let (applied, adjustment) = clamp_quantity(&product, requested, policy);
            db.delete_cart_item(item.id)?;
            if applied == 0 {
                db.delete_cart_item(existing.id)?;
            } else if applied != existing.quantity {
                db.set_cart_item_quantity(existing.id, applied)?;
            }
            adjustments.extend(adjustment);
            summed += 1;
        } else {
            let (applied, adjustment) = clamp_quantity(&product, item.quantity, policy);
            if applied == 0 {
                db.delete_cart_item(item.id)?;
            } else {
                db.move_cart_item(item.id, target.id, applied)?;
            }
            adjustments.extend(adjustment);
            moved += 1;
        }
    }

    db.set_cart_status(source.id, status, Some(target.id))?;
    db.touch_cart(target.id)?;

    tracing::info!(
        source = source.id,
        target = target.id,
        moved,
        summed,
        adjusted = adjustments.len(),
        "merged cart"
    );

    Ok(adjustments)
}

/// Fold a guest's active carts into the user's active cart, e.g. after sign-in.
pub fn merge_guest_cart(
    db: &Database,
    guest_id: &str,
    user_id: &str,
    policy: &CartPolicy,
) -> Result<Consolidation> {
    let guest_id = validate_user_id(guest_id)?;
    let user_id = validate_user_id(user_id)?;

    let tx = db.immediate_transaction()?;
    let mut report = consolidate_in(db, &user_id, policy)?;

    if guest_id != user_id {
        for guest_cart in db.active_carts_for_user(&guest_id)? {
            let adjustments =
                merge_cart_into(db, &guest_cart, &report.cart, policy, CartStatus::Merged)?;
            report.merged_cart_ids.push(guest_cart.id);
            report.adjustments.extend(adjustments);
        }
        if let Some(cart) = db.get_cart(report.cart.id)? {
            report.cart = cart;
        }
    }

    tx.commit()?;
    Ok(report)
}
