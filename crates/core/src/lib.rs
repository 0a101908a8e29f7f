pub mod config;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod receipt_sink;
pub mod store;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use error::{CrmError, CrmResult, ValidationError};
