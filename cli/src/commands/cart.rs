use anyhow::Result;

use basket_core::consolidation::{consolidate_active_cart, consolidate_all};
use basket_core::db::Database;
use basket_core::items::{add_item, cart_details, clear_cart, remove_item, set_item_quantity};
use basket_core::merger::merge_guest_cart;
use basket_core::models::{CartPolicy, Consolidation, format_cents};

use super::helpers::{print_adjustments, print_cart, resolve_product};

pub(crate) fn cmd_cart_show(
    db: &Database,
    user: &str,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    let cart = cart_details(db, user, policy)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&cart)?);
        return Ok(());
    }

    print_adjustments(&cart.adjustments);
    if cart.lines.is_empty() {
        eprintln!("Cart for {} is empty. Use `basket cart add` to add products.", cart.user_id);
    } else {
        print_cart(&cart);
    }

    Ok(())
}

pub(crate) fn cmd_cart_add(
    db: &Database,
    user: &str,
    product: &str,
    quantity: i64,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    let product = resolve_product(db, product)?;
    let outcome = add_item(db, user, product.id, quantity, policy)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_adjustments(outcome.adjustment.as_slice());
        println!(
            "Cart now has {} x '{}' at {}",
            outcome.item.quantity,
            product.name,
            format_cents(outcome.item.unit_price_cents)
        );
    }

    Ok(())
}

pub(crate) fn cmd_cart_set(
    db: &Database,
    user: &str,
    product: &str,
    quantity: i64,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    let product = resolve_product(db, product)?;
    let outcome = set_item_quantity(db, user, product.id, quantity, policy)?;

    if json {
        match outcome {
            Some(ref outcome) => println!("{}", serde_json::to_string_pretty(outcome)?),
            None => println!(
                "{}",
                serde_json::json!({ "removed": true, "product_id": product.id })
            ),
        }
    } else if let Some(outcome) = outcome {
        print_adjustments(outcome.adjustment.as_slice());
        println!(
            "Cart now has {} x '{}'",
            outcome.item.quantity, product.name
        );
    } else {
        println!("Removed '{}' from cart", product.name);
    }

    Ok(())
}

pub(crate) fn cmd_cart_remove(
    db: &Database,
    user: &str,
    product: &str,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    let product = resolve_product(db, product)?;
    let removed = remove_item(db, user, product.id, policy)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "removed": removed, "product_id": product.id })
        );
    } else if removed {
        println!("Removed '{}' from cart", product.name);
    } else {
        eprintln!("'{}' was not in the cart", product.name);
    }

    Ok(())
}

pub(crate) fn cmd_cart_clear(
    db: &Database,
    user: &str,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    let removed = clear_cart(db, user, policy)?;

    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Removed {removed} line(s) from cart");
    }

    Ok(())
}

pub(crate) fn cmd_cart_consolidate(
    db: &Database,
    user: Option<&str>,
    all: bool,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    let reports = match (user, all) {
        (_, true) => consolidate_all(db, policy)?,
        (Some(user), false) => vec![consolidate_active_cart(db, user, policy)?],
        (None, false) => anyhow::bail!("Pass --user <id> or --all"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("No duplicate active carts found");
    }
    for report in &reports {
        print_consolidation(report);
    }

    Ok(())
}

pub(crate) fn cmd_cart_merge(
    db: &Database,
    guest: &str,
    user: &str,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    let report = merge_guest_cart(db, guest, user, policy)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.merged_cart_ids.is_empty() {
        println!("No active cart found for guest {}", guest.trim());
    } else {
        print_consolidation(&report);
    }

    Ok(())
}

fn print_consolidation(report: &Consolidation) {
    print_adjustments(&report.adjustments);
    if report.merged_cart_ids.is_empty() {
        println!(
            "{}: cart #{} is the only active cart{}",
            report.cart.user_id,
            report.cart.id,
            if report.created { " (new)" } else { "" }
        );
    } else {
        let ids: Vec<String> = report
            .merged_cart_ids
            .iter()
            .map(|id| format!("#{id}"))
            .collect();
        println!(
            "{}: merged {} into cart #{}",
            report.cart.user_id,
            ids.join(", "),
            report.cart.id
        );
    }
}
