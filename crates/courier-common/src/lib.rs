//! Courier Common - Shared types and configuration
//!
//! This crate provides the configuration, error type and identifiers
//! shared by the storage layer, the delivery pipeline and the server binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
