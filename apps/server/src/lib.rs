//! DICOM index - Rust implementation
//!
//! The indexing core of a DICOM archive:
//! - Patient/Study/Series/Instance tree with main DICOM tags, metadata,
//!   labels and attachments
//! - Find requests planned into SQL for the built-in SQLite backend
//! - A compatibility layer for backends without native find
//! - A finder front-end for C-FIND style lookups with paging

// Allow clippy lints that are acceptable for this domain-specific codebase
#![allow(
    clippy::too_many_arguments,      // Functions with many args are acceptable for domain operations
    clippy::type_complexity,         // Complex types are acceptable when they represent domain concepts
    clippy::large_enum_variant,      // Large enum variants acceptable; boxing may impact performance
)]

pub mod config;
pub mod db;
pub mod error;
pub mod find;
pub mod finder;
pub mod logging;
pub mod models;
pub mod registry;

pub use config::Config;
pub use error::{Error, Result};
