use anyhow::{Result, bail};
use chrono::{DateTime, Local};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use basket_core::db::Database;
use basket_core::models::{
    AdjustmentReason, CartDetails, Order, Product, QuantityAdjustment, format_cents,
};

/// Resolve a product reference given on the command line: a numeric id, or a SKU.
pub(crate) fn resolve_product(db: &Database, reference: &str) -> Result<Product> {
    let reference = reference.trim();
    if let Ok(id) = reference.parse::<i64>() {
        if let Some(product) = db.get_product(id)? {
            return Ok(product);
        }
    }
    if let Some(product) = db.get_product_by_sku(reference)? {
        return Ok(product);
    }
    bail!("No product found for '{reference}' (use a product id or SKU)")
}

pub(crate) fn print_product_table(products: &[Product]) {
    #[derive(Tabled)]
    struct ProductRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "SKU")]
        sku: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Price")]
        price: String,
        #[tabled(rename = "Stock")]
        stock: i64,
        #[tabled(rename = "Active")]
        active: &'static str,
    }

    let rows: Vec<ProductRow> = products
        .iter()
        .map(|p| ProductRow {
            id: p.id,
            sku: p.sku.clone().unwrap_or_default(),
            name: truncate(&p.name, 35),
            price: format_cents(p.price_cents),
            stock: p.stock,
            active: if p.active { "yes" } else { "no" },
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_cart(cart: &CartDetails) {
    #[derive(Tabled)]
    struct LineRow {
        #[tabled(rename = "Product")]
        product_id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Qty")]
        quantity: i64,
        #[tabled(rename = "Unit")]
        unit: String,
        #[tabled(rename = "Total")]
        total: String,
    }

    let rows: Vec<LineRow> = cart
        .lines
        .iter()
        .map(|l| LineRow {
            product_id: l.product_id,
            name: if l.current_price_cents == l.unit_price_cents {
                truncate(&l.name, 35)
            } else {
                format!(
                    "{} (now {})",
                    truncate(&l.name, 28),
                    format_cents(l.current_price_cents)
                )
            },
            quantity: l.quantity,
            unit: format_cents(l.unit_price_cents),
            total: format_cents(l.line_total_cents),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    println!(
        "{} item(s), total {}",
        cart.total_items,
        format_cents(cart.total_cents)
    );
}

pub(crate) fn print_order(order: &Order) {
    #[derive(Tabled)]
    struct OrderLineRow {
        #[tabled(rename = "Product")]
        product_id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Qty")]
        quantity: i64,
        #[tabled(rename = "Unit")]
        unit: String,
        #[tabled(rename = "Total")]
        total: String,
    }

    println!(
        "Order #{} for {} ({})",
        order.id,
        order.user_id,
        format_timestamp(&order.created_at)
    );
    let rows: Vec<OrderLineRow> = order
        .items
        .iter()
        .map(|i| OrderLineRow {
            product_id: i.product_id,
            name: truncate(&i.product_name, 35),
            quantity: i.quantity,
            unit: format_cents(i.unit_price_cents),
            total: i.line_total_cents().map_or_else(|_| "-".to_string(), format_cents),
        })
        .collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    println!("Total: {}", format_cents(order.total_cents));
}

/// Report quantity caps on stderr so stdout stays clean for the main output.
pub(crate) fn print_adjustments(adjustments: &[QuantityAdjustment]) {
    for adj in adjustments {
        eprintln!("Note: {}", describe_adjustment(adj));
    }
}

pub(crate) fn describe_adjustment(adj: &QuantityAdjustment) -> String {
    let id = adj.product_id;
    match adj.reason {
        AdjustmentReason::StockLimit => format!(
            "product {id}: only {} in stock, quantity lowered from {}",
            adj.applied, adj.requested
        ),
        AdjustmentReason::MaxQuantity => format!(
            "product {id}: limited to {} per order, quantity lowered from {}",
            adj.applied, adj.requested
        ),
        AdjustmentReason::OutOfStock => format!("product {id}: out of stock, removed from cart"),
        AdjustmentReason::Unavailable => {
            format!("product {id}: no longer available, removed from cart")
        }
    }
}

/// Render a stored RFC 3339 timestamp in local time, falling back to the raw value.
pub(crate) fn format_timestamp(ts: &str) -> String {
    DateTime::parse_from_rfc3339(ts).map_or_else(
        |_| ts.to_string(),
        |dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
    )
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
