//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tuning knobs for an engine instance. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of detached workflows running concurrently. Bounds
    /// workflows, not steps: a single workflow's parallel wave may exceed it.
    #[serde(default = "default_detached_workers")]
    pub detached_workers: usize,

    /// Capacity of the broadcast event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_detached_workers() -> usize {
    10
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detached_workers: default_detached_workers(),
            event_capacity: default_event_capacity(),
        }
    }
}
