//! SSTIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! used by the object storage provider, the remote catalog and the remote
//! storage clients.

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::{Error, Result, ResultExt};
pub use types::*;
