mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_cart_add, cmd_cart_clear, cmd_cart_consolidate, cmd_cart_merge, cmd_cart_remove,
    cmd_cart_set, cmd_cart_show, cmd_checkout, cmd_order_list, cmd_order_show, cmd_product_add,
    cmd_product_check, cmd_product_import, cmd_product_list, cmd_product_price,
    cmd_product_set_active, cmd_product_show, cmd_product_stock,
};
use crate::config::Config;
use basket_core::db::Database;

const DEFAULT_LOG_FILTER: &str = "basket=info,basket_core=info";

#[derive(Parser)]
#[command(
    name = "basket",
    version,
    about = "A local-first marketplace cart",
    long_about = "A local-first marketplace cart.\n\n\
        Keeps one active cart per user, merges duplicate carts left behind by \
        concurrent sessions, and checks every quantity against live stock."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the product catalog
    Product {
        #[command(subcommand)]
        command: ProductCommands,
    },
    /// View and change a user's cart
    Cart {
        #[command(subcommand)]
        command: CartCommands,
    },
    /// Turn the user's cart into an order
    Checkout {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// View placed orders
    Order {
        #[command(subcommand)]
        command: OrderCommands,
    },
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum ProductCommands {
    /// Add a product to the catalog
    Add {
        /// Product name
        name: String,
        /// Unit price (e.g. "12.50")
        #[arg(long)]
        price: String,
        /// Units in stock
        #[arg(long, default_value = "0")]
        stock: i64,
        /// Stock keeping unit, must be unique
        #[arg(long)]
        sku: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List/search the catalog
    List {
        /// Search name or SKU
        #[arg(short, long)]
        search: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one product
    Show {
        /// Product id or SKU
        product: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the units in stock
    Stock {
        /// Product id or SKU
        product: String,
        /// New stock level
        stock: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the unit price
    Price {
        /// Product id or SKU
        product: String,
        /// New price (e.g. "12.50")
        price: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Take a product off sale
    Deactivate {
        /// Product id or SKU
        product: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Put a product back on sale
    Activate {
        /// Product id or SKU
        product: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether a quantity can go into a cart
    Check {
        /// Product id or SKU
        product: String,
        /// Quantity wanted
        #[arg(short, long, default_value = "1")]
        quantity: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import products from a CSV file (columns: sku,name,price,stock)
    Import {
        /// Path to the CSV file
        file: std::path::PathBuf,
        /// Preview import without making changes
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CartCommands {
    /// Show the cart with live totals
    Show {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add units of a product (adds to an existing line)
    Add {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Product id or SKU
        product: String,
        /// Units to add
        #[arg(short, long, default_value = "1")]
        quantity: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the quantity of a line (0 removes it)
    Set {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Product id or SKU
        product: String,
        /// New quantity
        quantity: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a product from the cart
    Remove {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Product id or SKU
        product: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every line from the cart
    Clear {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Merge duplicate active carts into one
    Consolidate {
        /// User id
        #[arg(short, long, required_unless_present = "all")]
        user: Option<String>,
        /// Consolidate every user with duplicate active carts
        #[arg(long, conflicts_with = "user")]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fold a guest's cart into a user's cart
    Merge {
        /// User id receiving the items
        #[arg(short, long)]
        user: String,
        /// Guest id whose cart is merged
        #[arg(short, long)]
        guest: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum OrderCommands {
    /// List a user's orders, newest first
    List {
        /// User id
        #[arg(short, long)]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one order
    Show {
        /// Order id
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::open(&config.db_path)?;
    let policy = config.policy;

    match cli.command {
        Commands::Product { command } => match command {
            ProductCommands::Add {
                name,
                price,
                stock,
                sku,
                json,
            } => cmd_product_add(&db, &name, &price, stock, sku, json),
            ProductCommands::List { search, json } => {
                cmd_product_list(&db, search.as_deref(), json)
            }
            ProductCommands::Show { product, json } => cmd_product_show(&db, &product, json),
            ProductCommands::Stock {
                product,
                stock,
                json,
            } => cmd_product_stock(&db, &product, stock, json),
            ProductCommands::Price {
                product,
                price,
                json,
            } => cmd_product_price(&db, &product, &price, json),
            ProductCommands::Deactivate { product, json } => {
                cmd_product_set_active(&db, &product, false, json)
            }
            ProductCommands::Activate { product, json } => {
                cmd_product_set_active(&db, &product, true, json)
            }
            ProductCommands::Check {
                product,
                quantity,
                json,
            } => cmd_product_check(&db, &product, quantity, &policy, json),
            ProductCommands::Import {
                file,
                dry_run,
                json,
            } => cmd_product_import(&db, &file, dry_run, json),
        },
        Commands::Cart { command } => match command {
            CartCommands::Show { user, json } => cmd_cart_show(&db, &user, &policy, json),
            CartCommands::Add {
                user,
                product,
                quantity,
                json,
            } => cmd_cart_add(&db, &user, &product, quantity, &policy, json),
            CartCommands::Set {
                user,
                product,
                quantity,
                json,
            } => cmd_cart_set(&db, &user, &product, quantity, &policy, json),
            CartCommands::Remove {
                user,
                product,
                json,
            } => cmd_cart_remove(&db, &user, &product, &policy, json),
            CartCommands::Clear { user, json } => cmd_cart_clear(&db, &user, &policy, json),
            CartCommands::Consolidate { user, all, json } => {
                cmd_cart_consolidate(&db, user.as_deref(), all, &policy, json)
            }
            CartCommands::Merge { user, guest, json } => {
                cmd_cart_merge(&db, &guest, &user, &policy, json)
            }
        },
        Commands::Checkout { user, json } => cmd_checkout(&db, &user, &policy, json),
        Commands::Order { command } => match command {
            OrderCommands::List { user, json } => cmd_order_list(&db, &user, json),
            OrderCommands::Show { id, json } => cmd_order_show(&db, id, json),
        },
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let (api_key, new_api_key) = if no_auth {
                (None, false)
            } else {
                let (key, new) = config.load_or_create_api_key()?;
                (Some(key), new)
            };
            server::start_server(db, policy, port, &bind, api_key, new_api_key).await
        }
    }
}
