use anyhow::{Context, Result};

use crate::db::Database;
use crate::merger::merge_cart_into;
use crate::models::{CartPolicy, CartStatus, Consolidation, validate_user_id};

/// Restore the single-active-cart invariant for `user_id`, creating a cart if
/// the user has none.
///
/// When concurrent writers left several active carts behind, the newest one
/// becomes canonical and every older one is merged into it. Runs in its own
/// immediate transaction; re-running it on any intermediate state converges
/// to the same result.
pub fn consolidate_active_cart(
    db: &Database,
    user_id: &str,
    policy: &CartPolicy,
) -> Result<Consolidation> {
    let user_id = validate_user_id(user_id)?;
    let tx = db.immediate_transaction()?;
    let report = consolidate_in(db, &user_id, policy)?;
    tx.commit()?;
    Ok(report)
}

/// Consolidate every user that currently owns more than one active cart.
pub fn consolidate_all(db: &Database, policy: &CartPolicy) -> Result<Vec<Consolidation>> {
    let tx = db.immediate_transaction()?;
    let mut reports = Vec::new();
    for user_id in db.users_with_duplicate_active_carts()? {
        if let Some(report) = consolidate_existing(db, &user_id, policy)? {
            reports.push(report);
        }
    }
    tx.commit()?;
    if !reports.is_empty() {
        tracing::info!(users = reports.len(), "consolidated duplicate carts");
    }
    Ok(reports)
}

/// Consolidation without a transaction of its own, for callers that already
/// hold one.
pub(crate) fn consolidate_in(
    db: &Database,
    user_id: &str,
    policy: &CartPolicy,
) -> Result<Consolidation> {
    if let Some(report) = consolidate_existing(db, user_id, policy)? {
        return Ok(report);
    }
    let cart = db.create_cart(user_id)?;
    tracing::debug!(user_id, cart_id = cart.id, "created active cart");
    Ok(Consolidation {
        cart,
        created: true,
        merged_cart_ids: Vec::new(),
        adjustments: Vec::new(),
    })
}

/// Like `consolidate_in`, but returns `None` instead of creating a cart.
pub(crate) fn consolidate_existing(
    db: &Database,
    user_id: &str,
    policy: &CartPolicy,
) -> Result<Option<Consolidation>> {
    let carts = db.active_carts_for_user(user_id)?;
    let Some((canonical, older)) = carts.split_first() else {
        return Ok(None);
    };

    if older.is_empty() {
        return Ok(Some(Consolidation {
            cart: canonical.clone(),
            created: false,
            merged_cart_ids: Vec::new(),
            adjustments: Vec::new(),
        }));
    }

    tracing::warn!(
        user_id,
        canonical = canonical.id,
        duplicates = older.len(),
        "found duplicate active carts"
    );

    let mut merged_cart_ids = Vec::with_capacity(older.len());
    let mut adjustments = Vec::new();
    for cart in older {
        adjustments.extend(merge_cart_into(
            db,
            cart,
            canonical,
            policy,
            CartStatus::Merged,
        )?);
        merged_cart_ids.push(cart.id);
    }

    let cart = db
        .get_cart(canonical.id)?
        .context("Canonical cart disappeared during consolidation")?;

    Ok(Some(Consolidation {
        cart,
        created: false,
        merged_cart_ids,
        adjustments,
    }))
}
