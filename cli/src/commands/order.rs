use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use basket_core::checkout::{checkout, get_order, list_orders};
use basket_core::db::Database;
use basket_core::models::{CartPolicy, format_cents};

use super::helpers::{format_timestamp, print_order};

pub(crate) fn cmd_checkout(
    db: &Database,
    user: &str,
    policy: &CartPolicy,
    json: bool,
) -> Result<()> {
    let order = checkout(db, user, policy)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&order)?);
    } else {
        print_order(&order);
    }

    Ok(())
}

pub(crate) fn cmd_order_list(db: &Database, user: &str, json: bool) -> Result<()> {
    let orders = list_orders(db, user)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&orders)?);
    } else if orders.is_empty() {
        eprintln!("No orders yet for {}.", user.trim());
    } else {
        #[derive(Tabled)]
        struct OrderRow {
            #[tabled(rename = "ID")]
            id: i64,
            #[tabled(rename = "Placed")]
            created_at: String,
            #[tabled(rename = "Lines")]
            lines: usize,
            #[tabled(rename = "Total")]
            total: String,
        }

        let rows: Vec<OrderRow> = orders
            .iter()
            .map(|o| OrderRow {
                id: o.id,
                created_at: format_timestamp(&o.created_at),
                lines: o.items.len(),
                total: format_cents(o.total_cents),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }

    Ok(())
}

pub(crate) fn cmd_order_show(db: &Database, id: i64, json: bool) -> Result<()> {
    let order = get_order(db, id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&order)?);
    } else {
        print_order(&order);
    }

    Ok(())
}
