//! Workflow and step definitions, and structural validation.
//!
//! Definitions are immutable once validated. They carry executor (and
//! optional compensator) capabilities as boxed async closures, so unlike the
//! execution-tracking types in `cadenza-types` they are not serializable.
//! Validation uses `petgraph` to model step dependencies as a directed graph;
//! topological sort detects cycles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cadenza_types::error::EngineError;
use futures_util::future::BoxFuture;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Input mapping handed to an executor.
pub type StepInput = HashMap<String, Value>;

/// Output mapping produced by an executor.
pub type StepOutput = HashMap<String, Value>;

/// Failure value produced by executors and compensators.
///
/// `Display` yields the raw message; retry gating substring-matches it
/// against the policy's retryable patterns.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for StepFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for StepFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}

/// The work a step performs: takes a cancellation scope and an input
/// mapping, produces an output mapping or a failure.
pub type StepExecutor = Arc<
    dyn Fn(CancellationToken, StepInput) -> BoxFuture<'static, Result<StepOutput, StepFailure>>
        + Send
        + Sync,
>;

/// Inverse operation for caller-driven rollback of a completed step.
pub type StepCompensator = Arc<
    dyn Fn(CancellationToken, StepInput) -> BoxFuture<'static, Result<(), StepFailure>>
        + Send
        + Sync,
>;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry behavior for a step. `max_attempts == 1` means no retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (>= 1).
    pub max_attempts: u32,
    /// Delay before the first retry. Zero yields no delay at all.
    pub initial_interval: Duration,
    /// Upper bound on the backoff delay. Zero means unbounded.
    pub max_interval: Duration,
    /// Exponential growth factor; 1.0 produces constant backoff.
    pub multiplier: f64,
    /// Failure-message substrings that gate retry. Empty means every
    /// failure is retryable.
    pub retryable_errors: Vec<String>,
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn interval_for(&self, attempt: u32) -> Duration {
        if self.initial_interval.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let interval = Duration::try_from_secs_f64(scaled).unwrap_or(self.max_interval);
        if !self.max_interval.is_zero() && interval > self.max_interval {
            self.max_interval
        } else {
            interval
        }
    }

    /// Whether a failure with this message qualifies for retry.
    pub fn is_retryable(&self, message: &str) -> bool {
        self.retryable_errors.is_empty()
            || self.retryable_errors.iter().any(|p| message.contains(p))
    }
}

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG. Immutable after validation.
#[derive(Clone)]
pub struct StepDefinition {
    /// User-defined step ID, unique within the workflow.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Optional longer description.
    pub description: String,
    /// The step's executor capability.
    pub executor: StepExecutor,
    /// Optional inverse capability for caller-driven rollback.
    pub compensator: Option<StepCompensator>,
    /// IDs of steps that must reach a terminal state before this one runs.
    pub dependencies: Vec<String>,
    /// Retry behavior; absent means a single attempt.
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt timeout. Zero means unbounded.
    pub timeout: Duration,
    /// Whether failure aborts the workflow (default true). Non-required
    /// steps transition to `skipped` on failure.
    pub required: bool,
    /// Whether the step may run concurrently with other parallel-eligible
    /// steps in the same ready wave (default false).
    pub parallel: bool,
    /// Scheduling priority within a wave; higher wins (default 0).
    pub priority: i32,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("required", &self.required)
            .field("parallel", &self.parallel)
            .field("priority", &self.priority)
            .field("compensator", &self.compensator.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A validated workflow: an acyclic set of steps with dependencies.
///
/// Step order in `steps` is the execution-order index recorded on step
/// instances.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    /// User-defined workflow ID.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    pub description: String,
    /// Version string (e.g. "1.0.0").
    pub version: String,
    /// Step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Free-form metadata.
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Look up a step definition by ID.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a definition.
///
/// Checks, in order: non-empty workflow ID and name, at least one step,
/// unique step IDs, dependency references resolve within the workflow, and
/// the dependency graph is acyclic. Runs once at registration; definitions
/// are immutable afterwards, so the check is never repeated at start.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), EngineError> {
    if def.id.is_empty() {
        return Err(EngineError::InvalidDefinition {
            id: def.id.clone(),
            reason: "workflow ID must not be empty".to_string(),
        });
    }
    if def.name.is_empty() {
        return Err(EngineError::InvalidDefinition {
            id: def.id.clone(),
            reason: "workflow name must not be empty".to_string(),
        });
    }
    if def.steps.is_empty() {
        return Err(EngineError::InvalidDefinition {
            id: def.id.clone(),
            reason: "workflow must have at least one step".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(EngineError::InvalidDefinition {
                id: def.id.clone(),
                reason: "step ID must not be empty".to_string(),
            });
        }
        if !seen.insert(step.id.as_str()) {
            return Err(EngineError::InvalidDefinition {
                id: step.id.clone(),
                reason: format!("duplicate step ID '{}'", step.id),
            });
        }
    }

    // Build directed graph: edge from dependency -> dependent.
    let id_to_idx: HashMap<&str, usize> = def
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = def
        .steps
        .iter()
        .map(|s| graph.add_node(s.id.as_str()))
        .collect();

    for step in &def.steps {
        let to = id_to_idx[step.id.as_str()];
        for dep in &step.dependencies {
            let from = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                EngineError::InvalidDefinition {
                    id: step.id.clone(),
                    reason: format!("step '{}' depends on unknown step '{}'", step.id, dep),
                }
            })?;
            graph.add_edge(nodes[*from], nodes[to], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let step_id = graph[cycle.node_id()];
        EngineError::InvalidDefinition {
            id: step_id.to_string(),
            reason: format!("cycle detected involving step '{step_id}'"),
        }
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_executor() -> StepExecutor {
        Arc::new(|_token, _input| Box::pin(async { Ok(StepOutput::new()) }))
    }

    fn step(id: &str, dependencies: Vec<&str>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            executor: noop_executor(),
            compensator: None,
            dependencies: dependencies.into_iter().map(String::from).collect(),
            retry_policy: None,
            timeout: Duration::ZERO,
            required: true,
            parallel: false,
            priority: 0,
        }
    }

    fn workflow(id: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            steps,
            metadata: HashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn valid_dag_passes() {
        let def = workflow(
            "etl",
            vec![step("extract", vec![]), step("load", vec!["extract"])],
        );
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn empty_workflow_id_rejected() {
        let def = workflow("", vec![step("a", vec![])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("workflow ID"));
    }

    #[test]
    fn empty_name_rejected() {
        let mut def = workflow("etl", vec![step("a", vec![])]);
        def.name = String::new();
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn no_steps_rejected() {
        let def = workflow("etl", vec![]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn duplicate_step_id_rejected() {
        let def = workflow("etl", vec![step("a", vec![]), step("a", vec![])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let def = workflow("etl", vec![step("a", vec!["missing"])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn two_step_cycle_rejected() {
        let def = workflow("etl", vec![step("a", vec!["b"]), step("b", vec!["a"])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn three_step_cycle_rejected() {
        let def = workflow(
            "etl",
            vec![
                step("a", vec!["c"]),
                step("b", vec!["a"]),
                step("c", vec!["b"]),
            ],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn diamond_is_acyclic() {
        let def = workflow(
            "etl",
            vec![
                step("a", vec![]),
                step("b", vec!["a"]),
                step("c", vec!["a"]),
                step("d", vec!["b", "c"]),
            ],
        );
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn self_dependency_rejected() {
        let def = workflow("etl", vec![step("a", vec!["a"])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    // -----------------------------------------------------------------------
    // Retry policy arithmetic
    // -----------------------------------------------------------------------

    fn policy(initial_ms: u64, max_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_millis(initial_ms),
            max_interval: Duration::from_millis(max_ms),
            multiplier,
            retryable_errors: vec![],
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let p = policy(100, 10_000, 2.0);
        assert_eq!(p.interval_for(1), Duration::from_millis(100));
        assert_eq!(p.interval_for(2), Duration::from_millis(200));
        assert_eq!(p.interval_for(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_caps_at_max_interval() {
        let p = policy(100, 250, 2.0);
        assert_eq!(p.interval_for(1), Duration::from_millis(100));
        assert_eq!(p.interval_for(2), Duration::from_millis(200));
        assert_eq!(p.interval_for(3), Duration::from_millis(250));
        assert_eq!(p.interval_for(10), Duration::from_millis(250));
    }

    #[test]
    fn zero_initial_interval_means_no_delay() {
        let p = policy(0, 30_000, 2.0);
        assert_eq!(p.interval_for(1), Duration::ZERO);
        assert_eq!(p.interval_for(4), Duration::ZERO);
    }

    #[test]
    fn unit_multiplier_is_constant_backoff() {
        let p = policy(50, 30_000, 1.0);
        assert_eq!(p.interval_for(1), Duration::from_millis(50));
        assert_eq!(p.interval_for(5), Duration::from_millis(50));
    }

    #[test]
    fn sub_unit_multiplier_shrinks() {
        let p = policy(100, 30_000, 0.5);
        assert_eq!(p.interval_for(1), Duration::from_millis(100));
        assert_eq!(p.interval_for(2), Duration::from_millis(50));
        assert_eq!(p.interval_for(3), Duration::from_millis(25));
    }

    #[test]
    fn zero_max_interval_is_unbounded() {
        let p = policy(100, 0, 2.0);
        assert_eq!(p.interval_for(10), Duration::from_millis(100 * 512));
    }

    // -----------------------------------------------------------------------
    // Retry gating
    // -----------------------------------------------------------------------

    #[test]
    fn empty_retryable_set_retries_everything() {
        let p = policy(0, 0, 1.0);
        assert!(p.is_retryable("anything at all"));
    }

    #[test]
    fn retryable_patterns_substring_match() {
        let mut p = policy(0, 0, 1.0);
        p.retryable_errors = vec!["timeout".to_string(), "connection reset".to_string()];
        assert!(p.is_retryable("upstream timeout after 5s"));
        assert!(p.is_retryable("connection reset by peer"));
        assert!(!p.is_retryable("invalid credentials"));
    }

    #[test]
    fn step_failure_displays_raw_message() {
        let failure = StepFailure::new("card declined");
        assert_eq!(failure.to_string(), "card declined");
        let failure: StepFailure = "boom".into();
        assert_eq!(failure.to_string(), "boom");
    }
}
