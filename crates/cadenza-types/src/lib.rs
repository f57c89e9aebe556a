//! Shared domain types for Cadenza.
//!
//! This crate contains the persistable data model of the workflow engine:
//! instance and event records, status enumerations, result records, engine
//! configuration, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod workflow;
