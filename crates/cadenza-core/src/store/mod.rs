//! Store contract for workflow state persistence.
//!
//! Defines the storage interface the engine drives: workflow instances,
//! step instances, and lifecycle events. Two implementations exist: the
//! reference [`memory::InMemoryStore`] in this crate (which defines the
//! contract's observable semantics) and the durable SQLite store in
//! `cadenza-infra`. Callers pick one at engine construction time.

pub mod memory;

use std::collections::HashMap;
use std::future::Future;

use cadenza_types::error::StoreError;
use cadenza_types::workflow::{
    StepInstance, StepStatus, WorkflowEvent, WorkflowInstance, WorkflowStatus,
};
use serde_json::Value;
use uuid::Uuid;

pub use memory::InMemoryStore;

/// Filter for [`WorkflowStore::list_workflows`]. All fields are optional;
/// set fields are AND-ed together.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    /// Match on the workflow definition ID.
    pub workflow_id: Option<String>,
    /// Match on the instance status.
    pub status: Option<WorkflowStatus>,
    /// Match on the trace identifier.
    pub trace_id: Option<String>,
    /// Match on the correlation identifier.
    pub correlation_id: Option<String>,
    /// Match on the business identifier.
    pub business_id: Option<String>,
}

impl WorkflowFilter {
    /// Whether an instance matches every set field.
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        if let Some(id) = &self.workflow_id {
            if &instance.workflow_id != id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if let Some(trace) = &self.trace_id {
            if &instance.trace_id != trace {
                return false;
            }
        }
        if let Some(corr) = &self.correlation_id {
            if &instance.correlation_id != corr {
                return false;
            }
        }
        if let Some(biz) = &self.business_id {
            if &instance.business_id != biz {
                return false;
            }
        }
        true
    }
}

/// Storage interface for workflow execution state.
///
/// Covers three entity families:
/// - **Workflows:** create/read/update workflow instances, filterable listing.
/// - **Steps:** create/read/update step instances, per-workflow listing.
/// - **Events:** append-only lifecycle audit records.
///
/// Contract points every implementation must honor:
/// - `save_workflow` and `save_step` are upserts keyed by entity ID.
/// - `get_workflow` returns the instance with its steps eagerly loaded,
///   ordered by execution order.
/// - `update_workflow_status` stamps `completed_at` on terminal statuses and
///   clears it on non-terminal ones; `update_step_status` additionally stamps
///   `started_at` when a step enters `running`.
/// - `update_workflow_error` / `update_step_error` also transition the entity
///   to `failed` and stamp `completed_at`.
/// - Reads return values isolated from internal state: mutating a returned
///   entity never affects subsequent reads.
///
/// Uses native async fn in traits (no `async_trait` macro); futures are
/// cancelled by dropping.
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Upsert a workflow instance.
    fn save_workflow(
        &self,
        instance: &WorkflowInstance,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Get a workflow instance by ID, steps eagerly loaded.
    fn get_workflow(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<WorkflowInstance, StoreError>> + Send;

    /// Update an instance's status, stamping/clearing `completed_at`.
    fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replace an instance's output mapping.
    fn update_workflow_output(
        &self,
        id: Uuid,
        output: &HashMap<String, Value>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Record an instance error; also transitions the instance to `failed`
    /// and stamps `completed_at`.
    fn update_workflow_error(
        &self,
        id: Uuid,
        error: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// List instances matching `filter`, paginated. Returns the page and the
    /// total match count before pagination.
    fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<(Vec<WorkflowInstance>, u64), StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Upsert a step instance.
    fn save_step(
        &self,
        step: &StepInstance,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Get a step instance by ID.
    fn get_step(&self, id: Uuid) -> impl Future<Output = Result<StepInstance, StoreError>> + Send;

    /// List a workflow's step instances ordered by execution order.
    fn get_workflow_steps(
        &self,
        workflow_inst_id: Uuid,
    ) -> impl Future<Output = Result<Vec<StepInstance>, StoreError>> + Send;

    /// Update a step's status, stamping `started_at` on `running` and
    /// `completed_at` on terminal statuses.
    fn update_step_status(
        &self,
        id: Uuid,
        status: StepStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replace a step's output mapping.
    fn update_step_output(
        &self,
        id: Uuid,
        output: &HashMap<String, Value>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Record a step error; also transitions the step to `failed` and stamps
    /// `completed_at`.
    fn update_step_error(
        &self,
        id: Uuid,
        error: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append a lifecycle event. Callers treat failures as best-effort.
    fn save_event(
        &self,
        event: &WorkflowEvent,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// List a workflow's events ordered by timestamp ascending.
    fn get_workflow_events(
        &self,
        workflow_inst_id: Uuid,
    ) -> impl Future<Output = Result<Vec<WorkflowEvent>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run `f` atomically where the backend supports it. Stores whose write
    /// discipline already serializes mutations may execute `f` directly.
    fn with_transaction<F, Fut, T>(
        &self,
        f: F,
    ) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send;
}
