use std::path::Path;

use anyhow::{Context, Result, bail};

use basket_core::catalog::{import_catalog, parse_catalog_csv};
use basket_core::db::Database;
use basket_core::models::{CartPolicy, NewProduct, format_cents, parse_price_cents};
use basket_core::stock::{StockCheck, check_stock};

use super::helpers::{json_error, print_product_table, resolve_product};

pub(crate) fn cmd_product_add(
    db: &Database,
    name: &str,
    price: &str,
    stock: i64,
    sku: Option<String>,
    json: bool,
) -> Result<()> {
    let price_cents = parse_price_cents(price)?;
    if let Some(ref sku) = sku {
        if db.get_product_by_sku(sku)?.is_some() {
            bail!("A product with SKU '{sku}' already exists");
        }
    }

    let product = db.insert_product(&NewProduct {
        sku,
        name: name.to_string(),
        price_cents,
        stock,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&product)?);
    } else {
        println!(
            "Added product #{}: {} at {} ({} in stock)",
            product.id,
            product.name,
            format_cents(product.price_cents),
            product.stock
        );
    }

    Ok(())
}

pub(crate) fn cmd_product_list(db: &Database, search: Option<&str>, json: bool) -> Result<()> {
    let products = db.list_products(search)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&products)?);
    } else if products.is_empty() {
        eprintln!("No products found. Use `basket product add` or `basket product import`.");
    } else {
        print_product_table(&products);
    }

    Ok(())
}

pub(crate) fn cmd_product_show(db: &Database, reference: &str, json: bool) -> Result<()> {
    let product = resolve_product(db, reference)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&product)?);
    } else {
        print_product_table(std::slice::from_ref(&product));
    }

    Ok(())
}

pub(crate) fn cmd_product_stock(
    db: &Database,
    reference: &str,
    stock: i64,
    json: bool,
) -> Result<()> {
    let product = resolve_product(db, reference)?;
    db.set_product_stock(product.id, stock)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "product_id": product.id, "stock": stock })
        );
    } else {
        println!(
            "Stock for '{}' set to {stock} (was {})",
            product.name, product.stock
        );
    }

    Ok(())
}

pub(crate) fn cmd_product_price(
    db: &Database,
    reference: &str,
    price: &str,
    json: bool,
) -> Result<()> {
    let product = resolve_product(db, reference)?;
    let price_cents = parse_price_cents(price)?;
    db.set_product_price(product.id, price_cents)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "product_id": product.id, "price_cents": price_cents })
        );
    } else {
        println!(
            "Price for '{}' set to {} (was {}). Carts keep the price they were added at.",
            product.name,
            format_cents(price_cents),
            format_cents(product.price_cents)
        );
    }

    Ok(())
}

pub(crate) fn cmd_product_set_active(
    db: &Database,
    reference: &str,
    active: bool,
    json: bool,
) -> Result<()> {
    let product = resolve_product(db, reference)?;
    db.set_product_active(product.id, active)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "product_id": product.id, "active": active })
        );
    } else if active {
        println!("Product '{}' is available again", product.name);
    } else {
        println!(
            "Product '{}' deactivated. It will be dropped from carts on their next read.",
            product.name
        );
    }

    Ok(())
}

pub(crate) fn cmd_product_check(
    db: &Database,
    reference: &str,
    quantity: i64,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    if quantity < 1 {
        bail!("Quantity must be at least 1");
    }
    let product = resolve_product(db, reference)?;
    let check = check_stock(&product, quantity, policy);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "product_id": product.id,
                "requested": quantity,
                "stock": product.stock,
                "result": check,
            })
        );
    } else {
        match check {
            StockCheck::Available => {
                println!("{quantity} x '{}' available", product.name);
            }
            StockCheck::Limited { available } => println!(
                "Only {available} x '{}' can be added (requested {quantity})",
                product.name
            ),
            StockCheck::OutOfStock => println!("'{}' is out of stock", product.name),
            StockCheck::Unavailable => println!("'{}' is not available", product.name),
        }
    }

    Ok(())
}

pub(crate) fn cmd_product_import(
    db: &Database,
    path: &Path,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let rows = parse_catalog_csv(file)?;

    if rows.is_empty() {
        if json {
            println!("{}", json_error("No rows found in CSV file"));
        } else {
            eprintln!("No rows found in CSV file.");
        }
        return Ok(());
    }

    let summary = import_catalog(db, &rows, dry_run)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "dry_run": dry_run,
                "rows_parsed": summary.rows_parsed,
                "created": summary.created,
                "updated": summary.updated,
                "skipped": summary.skipped,
            })
        );
    } else {
        if dry_run {
            println!("Dry run, no changes made.\n");
        } else {
            println!("Import complete.\n");
        }
        println!("  Rows parsed: {}", summary.rows_parsed);
        println!("  Created:     {}", summary.created);
        println!("  Updated:     {}", summary.updated);
        println!("  Unchanged:   {}", summary.skipped);
    }

    Ok(())
}
