mod cart;
mod helpers;
mod order;
mod product;

pub(crate) use cart::{
    cmd_cart_add, cmd_cart_clear, cmd_cart_consolidate, cmd_cart_merge, cmd_cart_remove,
    cmd_cart_set, cmd_cart_show,
};
pub(crate) use order::{cmd_checkout, cmd_order_list, cmd_order_show};
pub(crate) use product::{
    cmd_product_add, cmd_product_check, cmd_product_import, cmd_product_list, cmd_product_price,
    cmd_product_set_active, cmd_product_show, cmd_product_stock,
};
