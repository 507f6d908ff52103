//! Rx Protocol - Server Library
//!
//! Worker tasks that execute incoming calls for registered services.

#[allow(clippy::module_inception)]
mod server;

pub use server::*;
pub use crate::rpc::{CallHandler, Service, ServiceBuilder, ServiceData};
