//! Sqlite-backed package stores.
//!
//! The same two-table schema serves the local installed registry and the
//! cached index snapshot of each remote repository.

pub mod packages;

pub use packages::{DbError, DbResult, PackageDatabase};
