//! Recall core crate - error type, configuration, domain types, and logging.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::RecallConfig;
pub use error::{ErrorKind, RecallError, Result};
pub use types::*;
