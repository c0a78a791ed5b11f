use std::collections::HashMap;
use std::io::Read;

use anyhow::{Context, Result, bail};

use crate::db::Database;
use crate::models::{NewProduct, Product, parse_price_cents, validate_new_product};

/// A single row parsed from a catalog CSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub stock: i64,
}

/// Summary of what a catalog import would do / did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CatalogImportSummary {
    pub rows_parsed: usize,
    pub created: usize,
    pub updated: usize,
    /// Rows whose product already matched name, price and stock.
    pub skipped: usize,
}

/// Parse a catalog CSV from any reader.
///
/// Expected header: `sku,name,price,stock` (any order, case-insensitive).
/// Prices are decimal currency units; blank rows are skipped.
pub fn parse_catalog_csv<R: Read>(reader: R) -> Result<Vec<CatalogRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();
    let col = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .with_context(|| format!("Missing required column: {name}"))
    };

    let idx_sku = col("sku")?;
    let idx_name = col("name")?;
    let idx_price = col("price")?;
    let idx_stock = col("stock")?;

    let mut rows = Vec::new();

    for (i, result) in rdr.records().enumerate() {
        let line = i + 2;
        let record = result.with_context(|| format!("Failed to parse CSV row {line}"))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();

        if record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }

        let sku = field(idx_sku);
        let name = field(idx_name);
        if sku.is_empty() {
            bail!("Row {line}: sku is empty");
        }
        if name.is_empty() {
            bail!("Row {line}: name is empty");
        }
        let price_cents =
            parse_price_cents(field(idx_price)).with_context(|| format!("Row {line}: bad price"))?;
        let stock: i64 = field(idx_stock)
            .parse()
            .with_context(|| format!("Row {line}: bad stock '{}'", field(idx_stock)))?;
        if stock < 0 {
            bail!("Row {line}: stock must not be negative");
        }

        rows.push(CatalogRow {
            sku: sku.to_string(),
            name: name.to_string(),
            price_cents,
            stock,
        });
    }

    Ok(rows)
}

/// Upsert parsed rows by SKU. When `dry_run` is true, nothing is written.
///
/// All writes happen in one transaction: a failing row leaves the catalog
/// as it was.
pub fn import_catalog(
    db: &Database,
    rows: &[CatalogRow],
    dry_run: bool,
) -> Result<CatalogImportSummary> {
    let tx = db.immediate_transaction()?;
    let mut summary = CatalogImportSummary {
        rows_parsed: rows.len(),
        ..CatalogImportSummary::default()
    };

    // Rows seen earlier in this file, so dry runs count repeated SKUs correctly.
    let mut seen: HashMap<&str, CatalogRow> = HashMap::new();

    for row in rows {
        let new_product = NewProduct {
            sku: Some(row.sku.clone()),
            name: row.name.clone(),
            price_cents: row.price_cents,
            stock: row.stock,
        };
        validate_new_product(&new_product)
            .with_context(|| format!("Invalid product '{}'", row.sku))?;

        let current = match seen.get(row.sku.as_str()) {
            Some(prev) => Some(prev.clone()),
            None => db.get_product_by_sku(&row.sku)?.map(|p| row_of(&p)),
        };

        match current {
            Some(existing) if existing == *row => summary.skipped += 1,
            Some(_) => {
                if !dry_run {
                    db.update_product_by_sku(&new_product)?;
                }
                summary.updated += 1;
            }
            None => {
                if !dry_run {
                    db.insert_product(&new_product)?;
                }
                summary.created += 1;
            }
        }
        seen.insert(row.sku.as_str(), row.clone());
    }

    if dry_run {
        tx.rollback()?;
    } else {
        tx.commit()?;
        tracing::info!(
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            "imported catalog"
        );
    }
    Ok(summary)
}

fn row_of(product: &Product) -> CatalogRow {
    CatalogRow {
        sku: product.sku.clone().unwrap_or_default(),
        name: product.name.clone(),
        price_cents: product.price_cents,
        stock: product.stock,
    }
}
