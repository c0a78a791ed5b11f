use anyhow::Result;

use crate::consolidation::consolidate_existing;
use crate::db::Database;
use crate::models::{
    CartError, CartPolicy, CartStatus, Order, OrderItem, total_cents, validate_user_id,
};

/// Turn the user's active cart into an order.
///
/// Every line is checked against live stock before anything is written; a
/// short line fails the whole checkout with `InsufficientStock`. Lines above
/// the policy maximum are ordered at the maximum. On success
/// stock is decremented, the order is recorded at the snapshot prices and the
/// cart is archived, so the next add starts a fresh cart.
pub fn checkout(db: &Database, user_id: &str, policy: &CartPolicy) -> Result<Order> {
    let user_id = validate_user_id(user_id)?;

    let tx = db.immediate_transaction()?;
    let cart = consolidate_existing(db, &user_id, policy)?
        .ok_or(CartError::EmptyCart)?
        .cart;

    let items = db.cart_items(cart.id)?;
    if items.is_empty() {
        return Err(CartError::EmptyCart.into());
    }

    let mut order_items = Vec::with_capacity(items.len());
    for item in &items {
        let product = db
            .get_product(item.product_id)?
            .ok_or(CartError::ProductNotFound(item.product_id))?;
        if !product.active {
            return Err(CartError::ProductUnavailable(product.id).into());
        }
        // Lines written under a looser policy are lowered, as a cart read would.
        let quantity = item.quantity.min(policy.max_item_quantity);
        if quantity < item.quantity {
            tracing::info!(
                user_id = %user_id,
                product_id = product.id,
                requested = item.quantity,
                applied = quantity,
                "capped line at checkout"
            );
        }
        if product.stock < quantity {
            return Err(CartError::InsufficientStock {
                product_id: product.id,
                name: product.name,
                requested: quantity,
                available: product.stock,
            }
            .into());
        }
        order_items.push(OrderItem {
            product_id: product.id,
            product_name: product.name,
            quantity,
            unit_price_cents: item.unit_price_cents,
        });
    }
    total_cents(order_items.iter().map(|i| (i.quantity, i.unit_price_cents)))?;

    for item in &order_items {
        if !db.decrement_stock(item.product_id, item.quantity)? {
            return Err(CartError::OutOfStock(item.product_id).into());
        }
    }

    let order = db.insert_order(&user_id, cart.id, &order_items)?;
    db.set_cart_status(cart.id, CartStatus::Archived, None)?;
    tx.commit()?;

    tracing::info!(
        user_id = %user_id,
        order_id = order.id,
        cart_id = cart.id,
        total_cents = order.total_cents,
        "checked out cart"
    );
    Ok(order)
}

pub fn get_order(db: &Database, order_id: i64) -> Result<Order> {
    db.get_order(order_id)?
        .ok_or_else(|| CartError::OrderNotFound(order_id).into())
}

pub fn list_orders(db: &Database, user_id: &str) -> Result<Vec<Order>> {
    let user_id = validate_user_id(user_id)?;
    db.list_orders(&user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{add_item, cart_details};
    use crate::models::{NewProduct, Product};

    fn product(db: &Database, name: &str, price_cents: i64, stock: i64) -> Product {
        db.insert_product(&NewProduct {
            sku: None,
            name: name.to_string(),
            price_cents,
            stock,
        })
        .unwrap()
    }

    #[test]
    fn test_checkout_creates_order_and_archives_cart() {
        let db = Database::open_in_memory().unwrap();
        let policy = CartPolicy::default();
        let mug = product(&db, "Mug", 800, 5);
        let pen = product(&db, "Pen", 150, 10);

        add_item(&db, "alice", mug.id, 2, &policy).unwrap();
        add_item(&db, "alice", pen.id, 4, &policy).unwrap();
        let cart_id = cart_details(&db, "alice", &policy).unwrap().cart_id.unwrap();

        let order = checkout(&db, "alice", &policy).unwrap();
        assert_eq!(order.user_id, "alice");
        assert_eq!(order.cart_id, cart_id);
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.total_cents, 2 * 800 + 4 * 150);

        assert_eq!(db.get_product(mug.id).unwrap().unwrap().stock, 3);
        assert_eq!(db.get_product(pen.id).unwrap().unwrap().stock, 6);
        assert_eq!(
            db.get_cart(cart_id).unwrap().unwrap().status,
            CartStatus::Archived
        );
        assert!(db.active_carts_for_user("alice").unwrap().is_empty());

        // The next add starts a new cart
        let outcome = add_item(&db, "alice", mug.id, 1, &policy).unwrap();
        assert_ne!(outcome.item.cart_id, cart_id);
    }

    #[test]
    fn test_checkout_uses_snapshot_prices() {
        let db = Database::open_in_memory().unwrap();
        let policy = CartPolicy::default();
        let mug = product(&db, "Mug", 800, 5);

        add_item(&db, "alice", mug.id, 1, &policy).unwrap();
        db.set_product_price(mug.id, 1200).unwrap();

        let order = checkout(&db, "alice", &policy).unwrap();
        assert_eq!(order.items[0].unit_price_cents, 800);
        assert_eq!(order.total_cents, 800);
    }

    #[test]
    fn test_checkout_empty_cart() {
        let db = Database::open_in_memory().unwrap();
        let policy = CartPolicy::default();

        let err = checkout(&db, "alice", &policy).unwrap_err();
        assert_eq!(err.downcast_ref::<CartError>(), Some(&CartError::EmptyCart));

        db.create_cart("alice").unwrap();
        let err = checkout(&db, "alice", &policy).unwrap_err();
        assert_eq!(err.downcast_ref::<CartError>(), Some(&CartError::EmptyCart));
    }

    #[test]
    fn test_checkout_insufficient_stock_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let policy = CartPolicy::default();
        let mug = product(&db, "Mug", 800, 5);
        let pen = product(&db, "Pen", 150, 5);

        add_item(&db, "alice", pen.id, 2, &policy).unwrap();
        add_item(&db, "alice", mug.id, 4, &policy).unwrap();
        db.set_product_stock(mug.id, 1).unwrap();

        let err = checkout(&db, "alice", &policy).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CartError>(),
            Some(&CartError::InsufficientStock {
                product_id: mug.id,
                name: "Mug".to_string(),
                requested: 4,
                available: 1,
            })
        );

        // Nothing was written
        assert_eq!(db.get_product(pen.id).unwrap().unwrap().stock, 5);
        assert_eq!(db.active_carts_for_user("alice").unwrap().len(), 1);
        assert!(db.list_orders("alice").unwrap().is_empty());
    }

    #[test]
    fn test_checkout_consolidates_duplicates() {
        let db = Database::open_in_memory().unwrap();
        let policy = CartPolicy::default();
        let mug = product(&db, "Mug", 800, 5);

        let old = db.create_cart("alice").unwrap();
        db.insert_cart_item(old.id, mug.id, 1, 800).unwrap();
        let new = db.create_cart("alice").unwrap();
        db.insert_cart_item(new.id, mug.id, 1, 800).unwrap();

        let order = checkout(&db, "alice", &policy).unwrap();
        assert_eq!(order.cart_id, new.id);
        assert_eq!(order.items[0].quantity, 2);
        assert_eq!(db.get_product(mug.id).unwrap().unwrap().stock, 3);
    }

    #[test]
    fn test_checkout_rejects_overflowing_total() {
        let db = Database::open_in_memory().unwrap();
        let policy = CartPolicy::default();
        let yacht = product(&db, "Yacht", i64::MAX / 2 + 1, 5);

        add_item(&db, "alice", yacht.id, 2, &policy).unwrap();
        let err = checkout(&db, "alice", &policy).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CartError>(),
            Some(&CartError::TotalTooLarge)
        );

        assert_eq!(db.get_product(yacht.id).unwrap().unwrap().stock, 5);
        assert_eq!(db.active_carts_for_user("alice").unwrap().len(), 1);
        assert!(db.list_orders("alice").unwrap().is_empty());
    }

    #[test]
    fn test_checkout_applies_current_max_quantity() {
        let db = Database::open_in_memory().unwrap();
        let loose = CartPolicy::new(20).unwrap();
        let strict = CartPolicy::new(5).unwrap();
        let mug = product(&db, "Mug", 800, 30);

        add_item(&db, "alice", mug.id, 12, &loose).unwrap();
        let order = checkout(&db, "alice", &strict).unwrap();
        assert_eq!(order.items[0].quantity, 5);
        assert_eq!(order.total_cents, 5 * 800);
        assert_eq!(db.get_product(mug.id).unwrap().unwrap().stock, 25);
    }

    #[test]
    fn test_get_and_list_orders() {
        let db = Database::open_in_memory().unwrap();
        let policy = CartPolicy::default();
        let mug = product(&db, "Mug", 800, 5);

        add_item(&db, "alice", mug.id, 1, &policy).unwrap();
        let first = checkout(&db, "alice", &policy).unwrap();
        add_item(&db, "alice", mug.id, 2, &policy).unwrap();
        let second = checkout(&db, "alice", &policy).unwrap();

        let orders = list_orders(&db, "alice").unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].id, second.id);
        assert_eq!(get_order(&db, first.id).unwrap().total_cents, 800);

        let err = get_order(&db, 9999).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CartError>(),
            Some(&CartError::OrderNotFound(9999))
        );
    }
}
