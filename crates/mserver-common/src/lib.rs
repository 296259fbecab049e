//! mserver Common - Shared types and configuration
//!
//! This crate provides the configuration schema, the error type and the
//! small value types shared by the supervisor core and the daemon binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
