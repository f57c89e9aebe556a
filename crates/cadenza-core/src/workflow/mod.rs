//! Workflow engine core: definitions, scheduling, and execution.
//!
//! - `definition` -- definitions with executor capabilities, retry policies,
//!   and structural validation (unique IDs, reference integrity, acyclicity)
//! - `builder` -- fluent construction of definitions, steps, and retry
//!   policies
//! - `scheduler` -- ready-step selection, priority ordering, and
//!   sequential/parallel partitioning
//! - `step_runner` -- per-step attempt loop: timeout, backoff, retry gating,
//!   event emission
//! - `engine` -- the facade: register, start (blocking/detached), resume,
//!   query, compensate

pub mod builder;
pub mod definition;
pub mod engine;
pub mod scheduler;
pub mod step_runner;
