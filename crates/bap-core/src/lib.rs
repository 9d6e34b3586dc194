pub mod config;
pub mod error;
pub mod models;

pub use config::BapConfig;
pub use error::{BapError, Result};
pub use models::*;
