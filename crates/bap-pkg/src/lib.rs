pub mod archive;
pub mod download;
pub mod error;
pub mod installer;
pub mod lock;
pub mod manager;
pub mod metadata;
pub mod models;
pub mod repository;
pub mod search;
pub mod sync;

pub use error::{PkgError, Result};
pub use manager::PackageManager;
pub use models::*;
