//! Listmail Common - Shared types and utilities
//!
//! This crate provides the configuration, the error taxonomy and the
//! value types shared by the subscriber store, the delivery engine and
//! the delivery agent binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Audience, Error, Result};
pub use types::{normalize_address, AllowedSenders};
