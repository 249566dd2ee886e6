//! RSSP Service - CSC v1 remote signing over HTTP
//!
//! Exposes credential listing, credential info, SAD authorization and hash
//! signing. Keys live wrapped at rest and are only unwrapped inside a
//! pooled device session, either a PKCS#11 token or the in-process
//! software device.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod bootstrap;
pub mod config;
pub mod handlers;
pub mod server;

pub use config::{ConfigError, DeviceKind, RsspConfig};
