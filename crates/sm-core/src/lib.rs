pub mod config;
pub mod element;
pub mod loops;
pub mod plan;
pub mod reconcile;
pub mod record;
pub mod sqlite_store;
pub mod store;
pub mod tree;
