//! Fluent builders for workflow definitions, steps, and retry policies.
//!
//! Pure data-structure construction; `build()` runs the same validation as
//! registration, so a built definition is guaranteed structurally valid.

use std::collections::HashMap;
use std::time::Duration;

use cadenza_types::error::EngineError;
use serde_json::Value;

use super::definition::{
    validate_definition, RetryPolicy, StepCompensator, StepDefinition, StepExecutor,
    WorkflowDefinition,
};

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Builds a [`WorkflowDefinition`].
pub struct WorkflowBuilder {
    workflow: WorkflowDefinition,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow: WorkflowDefinition {
                id: id.into(),
                name: name.into(),
                description: String::new(),
                version: "1.0.0".to_string(),
                steps: Vec::new(),
                metadata: HashMap::new(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.workflow.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.workflow.version = version.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.workflow.metadata.insert(key.into(), value);
        self
    }

    pub fn add_step(mut self, step: StepDefinition) -> Self {
        self.workflow.steps.push(step);
        self
    }

    /// Validate and return the definition.
    pub fn build(self) -> Result<WorkflowDefinition, EngineError> {
        validate_definition(&self.workflow)?;
        Ok(self.workflow)
    }
}

// ---------------------------------------------------------------------------
// StepBuilder
// ---------------------------------------------------------------------------

/// Builds a [`StepDefinition`].
pub struct StepBuilder {
    step: StepDefinition,
}

impl StepBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>, executor: StepExecutor) -> Self {
        Self {
            step: StepDefinition {
                id: id.into(),
                name: name.into(),
                description: String::new(),
                executor,
                compensator: None,
                dependencies: Vec::new(),
                retry_policy: None,
                timeout: Duration::ZERO,
                required: true,
                parallel: false,
                priority: 0,
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.step.description = description.into();
        self
    }

    pub fn dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn compensator(mut self, compensator: StepCompensator) -> Self {
        self.step.compensator = Some(compensator);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.step.retry_policy = Some(policy);
        self
    }

    /// Per-attempt timeout; `Duration::ZERO` means unbounded.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.step.timeout = timeout;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.step.required = required;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.step.parallel = parallel;
        self
    }

    /// Scheduling priority; higher runs first within a wave.
    pub fn priority(mut self, priority: i32) -> Self {
        self.step.priority = priority;
        self
    }

    pub fn build(self) -> Result<StepDefinition, EngineError> {
        if self.step.id.is_empty() {
            return Err(EngineError::InvalidDefinition {
                id: self.step.id.clone(),
                reason: "step ID must not be empty".to_string(),
            });
        }
        if self.step.name.is_empty() {
            return Err(EngineError::InvalidDefinition {
                id: self.step.id.clone(),
                reason: "step name must not be empty".to_string(),
            });
        }
        Ok(self.step)
    }
}

// ---------------------------------------------------------------------------
// RetryPolicyBuilder
// ---------------------------------------------------------------------------

/// Builds a [`RetryPolicy`]. Defaults: 3 attempts, 1s initial, 30s max,
/// 2.0 multiplier, all failures retryable.
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(30),
                multiplier: 2.0,
                retryable_errors: Vec::new(),
            },
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.policy.initial_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.policy.max_interval = interval;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn retryable_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy.retryable_errors = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
