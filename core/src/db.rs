use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use uuid::Uuid;

use crate::models::{
    Cart, CartItem, CartStatus, NewProduct, Order, OrderItem, Product, total_cents,
    validate_new_product,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const PRODUCT_COLUMNS: &str =
    "id, uuid, sku, name, price_cents, stock, active, created_at, updated_at";
const CART_COLUMNS: &str = "id, uuid, user_id, status, merged_into, created_at, updated_at";
const CART_ITEM_COLUMNS: &str =
    "id, cart_id, product_id, quantity, unit_price_cents, added_at, updated_at";

pub struct Database {
    conn: Connection,
}

/// Timestamp format used for every stored row. Fixed width and UTC, so
/// lexical order matches chronological order.
pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Serialize concurrent first-time migrations on a shared file.
        let tx = self.immediate_transaction()?;
        let version: i64 = tx.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS products (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    sku TEXT UNIQUE,
                    name TEXT NOT NULL,
                    price_cents INTEGER NOT NULL CHECK (price_cents >= 0),
                    stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS carts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    user_id TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('active', 'merged', 'archived')),
                    merged_into INTEGER REFERENCES carts(id),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cart_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    cart_id INTEGER NOT NULL REFERENCES carts(id) ON DELETE CASCADE,
                    product_id INTEGER NOT NULL REFERENCES products(id),
                    quantity INTEGER NOT NULL CHECK (quantity > 0),
                    unit_price_cents INTEGER NOT NULL,
                    added_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_carts_user_status ON carts(user_id, status);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_cart_items_cart_product
                    ON cart_items(cart_id, product_id);
                CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    user_id TEXT NOT NULL,
                    cart_id INTEGER NOT NULL REFERENCES carts(id),
                    total_cents INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS order_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                    product_id INTEGER NOT NULL REFERENCES products(id),
                    product_name TEXT NOT NULL,
                    quantity INTEGER NOT NULL CHECK (quantity > 0),
                    unit_price_cents INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);
                CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);

                PRAGMA user_version = 2;",
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Begin a write transaction that takes the database lock up front.
    ///
    /// Statements issued through `self` while the returned guard is alive run
    /// inside it. Dropping the guard without `commit` rolls back.
    pub fn immediate_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin transaction")
    }

    // --- Row mapping helpers ---

    fn product_from_row(row: &rusqlite::Row) -> rusqlite::Result<Product> {
        Ok(Product {
            id: row.get(0)?,
            uuid: row.get(1)?,
            sku: row.get(2)?,
            name: row.get(3)?,
            price_cents: row.get(4)?,
            stock: row.get(5)?,
            active: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn cart_from_row(row: &rusqlite::Row) -> rusqlite::Result<Cart> {
        let status: String = row.get(3)?;
        let status = status.parse::<CartStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;
        Ok(Cart {
            id: row.get(0)?,
            uuid: row.get(1)?,
            user_id: row.get(2)?,
            status,
            merged_into: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn cart_item_from_row(row: &rusqlite::Row) -> rusqlite::Result<CartItem> {
        Ok(CartItem {
            id: row.get(0)?,
            cart_id: row.get(1)?,
            product_id: row.get(2)?,
            quantity: row.get(3)?,
            unit_price_cents: row.get(4)?,
            added_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    // --- Products ---

    pub fn insert_product(&self, product: &NewProduct) -> Result<Product> {
        validate_new_product(product)?;
        let now = now();
        let uuid = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO products (uuid, sku, name, price_cents, stock, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
                params![
                    uuid,
                    product.sku,
                    product.name.trim(),
                    product.price_cents,
                    product.stock,
                    now,
                    now,
                ],
            )
            .with_context(|| format!("Failed to insert product '{}'", product.name))?;
        let id = self.conn.last_insert_rowid();
        self.get_product(id)?.context("Product not found")
    }

    pub fn get_product(&self, id: i64) -> Result<Option<Product>> {
        let product = self
            .conn
            .query_row(
                &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
                params![id],
                Self::product_from_row,
            )
            .optional()?;
        Ok(product)
    }

    pub fn get_product_by_sku(&self, sku: &str) -> Result<Option<Product>> {
        let product = self
            .conn
            .query_row(
                &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = ?1"),
                params![sku],
                Self::product_from_row,
            )
            .optional()?;
        Ok(product)
    }

    pub fn list_products(&self, search: Option<&str>) -> Result<Vec<Product>> {
        if let Some(query) = search {
            let escaped = query
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            let pattern = format!("%{escaped}%");
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products
                 WHERE name LIKE ?1 ESCAPE '\\' OR sku LIKE ?1 ESCAPE '\\'
                 ORDER BY name LIMIT 50"
            ))?;
            let products = stmt
                .query_map(params![pattern], Self::product_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(products);
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY name LIMIT 200"
        ))?;
        let products = stmt
            .query_map([], Self::product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    /// Update name, price and stock of the product with the given SKU.
    pub fn update_product_by_sku(&self, product: &NewProduct) -> Result<bool> {
        validate_new_product(product)?;
        let rows = self.conn.execute(
            "UPDATE products SET name = ?1, price_cents = ?2, stock = ?3, updated_at = ?4
             WHERE sku = ?5",
            params![
                product.name.trim(),
                product.price_cents,
                product.stock,
                now(),
                product.sku,
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn set_product_stock(&self, id: i64, stock: i64) -> Result<bool> {
        anyhow::ensure!(stock >= 0, "stock must not be negative");
        let rows = self.conn.execute(
            "UPDATE products SET stock = ?1, updated_at = ?2 WHERE id = ?3",
            params![stock, now(), id],
        )?;
        Ok(rows > 0)
    }

    pub fn set_product_price(&self, id: i64, price_cents: i64) -> Result<bool> {
        anyhow::ensure!(price_cents >= 0, "price must not be negative");
        let rows = self.conn.execute(
            "UPDATE products SET price_cents = ?1, updated_at = ?2 WHERE id = ?3",
            params![price_cents, now(), id],
        )?;
        Ok(rows > 0)
    }

    pub fn set_product_active(&self, id: i64, active: bool) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE products SET active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, now(), id],
        )?;
        Ok(rows > 0)
    }

    /// Take `quantity` units out of stock. Returns false, leaving the row
    /// untouched, when fewer units are on hand.
    pub fn decrement_stock(&self, id: i64, quantity: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE products SET stock = stock - ?1, updated_at = ?2
             WHERE id = ?3 AND stock >= ?1",
            params![quantity, now(), id],
        )?;
        Ok(rows > 0)
    }

    // --- Carts ---

    pub fn create_cart(&self, user_id: &str) -> Result<Cart> {
        let now = now();
        let uuid = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO carts (uuid, user_id, status, created_at, updated_at)
             VALUES (?1, ?2, 'active', ?3, ?4)",
            params![uuid, user_id, now, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_cart(id)?.context("Cart not found")
    }

    pub fn get_cart(&self, id: i64) -> Result<Option<Cart>> {
        let cart = self
            .conn
            .query_row(
                &format!("SELECT {CART_COLUMNS} FROM carts WHERE id = ?1"),
                params![id],
                Self::cart_from_row,
            )
            .optional()?;
        Ok(cart)
    }

    /// Active carts of a user, newest first.
    pub fn active_carts_for_user(&self, user_id: &str) -> Result<Vec<Cart>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CART_COLUMNS} FROM carts
             WHERE user_id = ?1 AND status = 'active'
             ORDER BY created_at DESC, id DESC"
        ))?;
        let carts = stmt
            .query_map(params![user_id], Self::cart_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(carts)
    }

    /// Users currently owning more than one active cart.
    pub fn users_with_duplicate_active_carts(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM carts WHERE status = 'active'
             GROUP BY user_id HAVING COUNT(*) > 1 ORDER BY user_id",
        )?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(users)
    }

    pub fn set_cart_status(
        &self,
        id: i64,
        status: CartStatus,
        merged_into: Option<i64>,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE carts SET status = ?1, merged_into = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), merged_into, now(), id],
        )?;
        Ok(rows > 0)
    }

    pub fn touch_cart(&self, id: i64) -> Result<String> {
        let now = now();
        self.conn.execute(
            "UPDATE carts SET updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(now)
    }

    // --- Cart items ---

    pub fn cart_items(&self, cart_id: i64) -> Result<Vec<CartItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CART_ITEM_COLUMNS} FROM cart_items WHERE cart_id = ?1 ORDER BY added_at, id"
        ))?;
        let items = stmt
            .query_map(params![cart_id], Self::cart_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn get_cart_item(&self, id: i64) -> Result<Option<CartItem>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {CART_ITEM_COLUMNS} FROM cart_items WHERE id = ?1"),
                params![id],
                Self::cart_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    pub fn find_cart_item(&self, cart_id: i64, product_id: i64) -> Result<Option<CartItem>> {
        let item = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CART_ITEM_COLUMNS} FROM cart_items
                     WHERE cart_id = ?1 AND product_id = ?2"
                ),
                params![cart_id, product_id],
                Self::cart_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    pub fn insert_cart_item(
        &self,
        cart_id: i64,
        product_id: i64,
        quantity: i64,
        unit_price_cents: i64,
    ) -> Result<CartItem> {
        let now = now();
        self.conn.execute(
            "INSERT INTO cart_items (cart_id, product_id, quantity, unit_price_cents, added_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![cart_id, product_id, quantity, unit_price_cents, now, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_cart_item(id)?.context("Cart item not found")
    }

    pub fn set_cart_item_quantity(&self, id: i64, quantity: i64) -> Result<CartItem> {
        self.conn.execute(
            "UPDATE cart_items SET quantity = ?1, updated_at = ?2 WHERE id = ?3",
            params![quantity, now(), id],
        )?;
        self.get_cart_item(id)?.context("Cart item not found")
    }

    /// Re-parent a line item to another cart, keeping its price snapshot.
    pub fn move_cart_item(&self, id: i64, cart_id: i64, quantity: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE cart_items SET cart_id = ?1, quantity = ?2, updated_at = ?3 WHERE id = ?4",
            params![cart_id, quantity, now(), id],
        )?;
        Ok(())
    }

    pub fn delete_cart_item(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM cart_items WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn delete_cart_items(&self, cart_id: i64) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM cart_items WHERE cart_id = ?1", params![cart_id])?;
        Ok(rows)
    }

    // --- Orders ---

    pub fn insert_order(
        &self,
        user_id: &str,
        cart_id: i64,
        items: &[OrderItem],
    ) -> Result<Order> {
        let now = now();
        let uuid = Uuid::new_v4().to_string();
        let total_cents = total_cents(items.iter().map(|i| (i.quantity, i.unit_price_cents)))?;
        self.conn.execute(
            "INSERT INTO orders (uuid, user_id, cart_id, total_cents, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![uuid, user_id, cart_id, total_cents, now],
        )?;
        let order_id = self.conn.last_insert_rowid();
        for item in items {
            self.conn.execute(
                "INSERT INTO order_items (order_id, product_id, product_name, quantity, unit_price_cents)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    order_id,
                    item.product_id,
                    item.product_name,
                    item.quantity,
                    item.unit_price_cents,
                ],
            )?;
        }
        self.get_order(order_id)?.context("Order not found")
    }

    fn order_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT product_id, product_name, quantity, unit_price_cents
             FROM order_items WHERE order_id = ?1 ORDER BY id",
        )?;
        let items = stmt
            .query_map(params![order_id], |row| {
                Ok(OrderItem {
                    product_id: row.get(0)?,
                    product_name: row.get(1)?,
                    quantity: row.get(2)?,
                    unit_price_cents: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    // Expects columns: 0: id, 1: uuid, 2: user_id, 3: cart_id, 4: total_cents, 5: created_at
    fn order_from_row(row: &rusqlite::Row) -> rusqlite::Result<Order> {
        Ok(Order {
            id: row.get(0)?,
            uuid: row.get(1)?,
            user_id: row.get(2)?,
            cart_id: row.get(3)?,
            total_cents: row.get(4)?,
            created_at: row.get(5)?,
            items: Vec::new(),
        })
    }

    pub fn get_order(&self, id: i64) -> Result<Option<Order>> {
        let order = self
            .conn
            .query_row(
                "SELECT id, uuid, user_id, cart_id, total_cents, created_at FROM orders WHERE id = ?1",
                params![id],
                Self::order_from_row,
            )
            .optional()?;
        match order {
            Some(mut order) => {
                order.items = self.order_items(order.id)?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    pub fn list_orders(&self, user_id: &str) -> Result<Vec<Order>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, uuid, user_id, cart_id, total_cents, created_at FROM orders
             WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let mut orders = stmt
            .query_map(params![user_id], Self::order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for order in &mut orders {
            order.items = self.order_items(order.id)?;
        }
        Ok(orders)
    }
}
