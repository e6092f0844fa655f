//! # Harvest Common Library
//!
//! Shared code for the harvest data-collection and retraining pipeline:
//! - Error type shared by every crate
//! - Root folder and TOML configuration resolution
//! - SQLite initialization (schema, WAL, busy timeout)
//! - UTC date/time helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
