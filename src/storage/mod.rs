//! Durable tables: UTXOs, transactions, blocks, vault records.

pub mod schema;
pub mod store;

pub use schema::{cf_names, DatabaseManager, DbConfig};
pub use store::{Store, StoreError};
