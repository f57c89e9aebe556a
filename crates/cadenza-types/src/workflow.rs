//! Workflow execution tracking types.
//!
//! Defines the persistable state of the engine: `WorkflowInstance` and
//! `StepInstance` records (one per start, one per definition step), the
//! `WorkflowEvent` audit record, and the status enumerations. Definitions
//! themselves live in `cadenza-core` because they carry executor capabilities
//! and cannot be serialized.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enumerations
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl WorkflowStatus {
    /// Terminal statuses: no further transitions happen without an explicit
    /// resume.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The wire representation (matches the serde encoding).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "retrying" => Ok(Self::Retrying),
            other => Err(format!("unknown workflow status: '{other}'")),
        }
    }
}

/// Status of an individual step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl StepStatus {
    /// Terminal statuses for a step.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether this status satisfies a dependent step's dependency.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// The wire representation (matches the serde encoding).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "retrying" => Ok(Self::Retrying),
            other => Err(format!("unknown step status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

/// A single execution of a workflow definition.
///
/// Created when a workflow is started and mutated through the store contract
/// until it reaches a terminal status. `context` accumulates step outputs as
/// the run progresses and feeds downstream step inputs; `output` is the
/// flattened union of all step outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID, assigned at start.
    pub id: Uuid,
    /// ID of the workflow definition being executed.
    pub workflow_id: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Caller-supplied input mapping.
    pub input: HashMap<String, Value>,
    /// Flattened union of step outputs, finalized on completion.
    pub output: HashMap<String, Value>,
    /// Accumulated step outputs, both flattened and nested per step ID.
    pub context: HashMap<String, Value>,
    /// ID of the step currently executing. Not maintained during parallel
    /// waves; consumers must not rely on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Step instances, one per definition step, ordered by execution order.
    pub steps: Vec<StepInstance>,
    /// When the instance was created.
    pub started_at: DateTime<Utc>,
    /// When the instance reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message when the instance failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times the whole instance has been re-driven after failure.
    pub retry_count: u32,
    /// Timestamp of the most recent instance-level retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Caller-supplied metadata, carried verbatim.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// Distributed-tracing identifier.
    pub trace_id: String,
    /// Cross-system correlation identifier.
    pub correlation_id: String,
    /// Business-domain identifier (empty when not supplied).
    #[serde(default)]
    pub business_id: String,
}

impl WorkflowInstance {
    /// Whether the instance is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a failed instance is eligible for another resume attempt.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.status == WorkflowStatus::Failed && self.retry_count < max_retries
    }
}

// ---------------------------------------------------------------------------
// Step instance
// ---------------------------------------------------------------------------

/// Execution record for a single step within a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    /// UUIDv7 step-instance ID.
    pub id: Uuid,
    /// ID of the step definition this instance executes.
    pub step_id: String,
    /// Owning workflow instance.
    pub workflow_inst_id: Uuid,
    /// Current status.
    pub status: StepStatus,
    /// Input mapping assembled for the most recent execution.
    pub input: HashMap<String, Value>,
    /// Output mapping produced on success.
    pub output: HashMap<String, Value>,
    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message of the final failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of retries performed (0 on first-try success).
    pub retry_count: u32,
    /// Timestamp of the most recent retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the most recent attempt, in milliseconds.
    pub duration_ms: i64,
    /// Position of the step in the definition.
    pub execution_order: usize,
    /// Scheduling priority copied from the definition (higher wins).
    pub priority: i32,
}

impl StepInstance {
    /// Whether the step is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Workflow event
// ---------------------------------------------------------------------------

/// Lifecycle audit event.
///
/// Event types are dotted lower-case tokens: `workflow.started`,
/// `workflow.completed`, `workflow.failed`, `step.started`, `step.completed`,
/// `step.failed`, `step.retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// UUIDv7 event ID.
    pub id: Uuid,
    /// Owning workflow instance.
    pub workflow_inst_id: Uuid,
    /// Step instance the event refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_inst_id: Option<Uuid>,
    /// Dotted lower-case event type tag.
    pub event_type: String,
    /// Arbitrary event payload.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub event_data: HashMap<String, Value>,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow result
// ---------------------------------------------------------------------------

/// Result record returned by blocking start and resume calls.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    /// Whether the workflow reached `completed`.
    pub success: bool,
    /// The instance in its final observed state.
    pub instance: WorkflowInstance,
    /// Flattened workflow output (empty when the workflow did not complete).
    pub output: HashMap<String, Value>,
    /// Error message when the workflow failed or was cancelled.
    pub error: Option<String>,
    /// Wall-clock duration of this call.
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
