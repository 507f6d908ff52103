//! Core constants, configuration and error types.

pub mod constants;
mod config;
mod error;
mod lock;

pub use config::*;
pub use error::*;
pub(crate) use lock::lock;
