//! # CMIG Common Library
//!
//! Shared code for the clinic migration services:
//! - Error and result types
//! - TOML configuration loading and root folder resolution
//! - Logging initialization
//! - Timestamp helpers for database persistence

pub mod config;
pub mod error;
pub mod time;

pub use error::{Error, Result};
