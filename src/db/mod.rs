//! Database module for modelwatch.
//!
//! Provides SQLite storage with embedded migrations.

mod defaults;
mod models;
mod store;

pub use defaults::*;
pub use models::*;
pub use store::*;

#[cfg(test)]
pub(crate) use store::tests as test_support;
