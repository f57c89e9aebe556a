//! Execution engine for Cadenza.
//!
//! This crate defines the store contract (the "port" that persistence
//! implementations fill in), the reference in-memory store, and the engine
//! itself: definition validation, builders, dependency-aware scheduling,
//! the per-step attempt loop, and the blocking/detached/resume facade.
//! It depends only on `cadenza-types` -- never on a database or IO crate.

pub mod event;
pub mod store;
pub mod workflow;
