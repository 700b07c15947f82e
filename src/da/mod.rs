//! Data-availability layer integration.

pub mod client;

pub use client::{derive_namespace, DaClient, DaError, NAMESPACE_LEN};
