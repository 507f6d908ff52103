//! Rx Protocol - Client Library
//!
//! Connections to remote services and the calls made over them.

#[allow(clippy::module_inception)]
mod client;

pub use client::*;
pub use crate::rpc::RxCall;
