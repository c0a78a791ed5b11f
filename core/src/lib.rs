pub mod catalog;
pub mod checkout;
pub mod consolidation;
pub mod db;
pub mod items;
pub mod merger;
pub mod models;
pub mod stock;
