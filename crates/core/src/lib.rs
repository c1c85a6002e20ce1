//! Core domain types for driftsync.
//!
//! This crate holds the value types that flow through the capture pipeline
//! (operations, object paths, update records) plus the immutable runtime
//! configuration. It has no I/O beyond config loading so that the heavier
//! `driftsync` crate can depend on it from every module.

pub mod config;
pub mod record;

pub use config::Config;
pub use record::{ObjectPath, Operation, UpdateHeaders, UpdateRecord};
