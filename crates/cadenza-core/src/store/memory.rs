//! Reference in-memory store.
//!
//! Three maps (workflow, step, event, each keyed by entity ID) behind a
//! single reader-writer lock. Every read hands out a clone of the stored
//! entity and every write stores a clone of the supplied entity; because the
//! records own all their data, `Clone` is a deep copy and preserves the
//! presence/absence of every optional field. The engine mutates in-flight
//! instances on its own tasks, so without this isolation concurrent readers
//! would observe torn state.

use std::collections::HashMap;
use std::future::Future;

use cadenza_types::error::StoreError;
use cadenza_types::workflow::{
    StepInstance, StepStatus, WorkflowEvent, WorkflowInstance, WorkflowStatus,
};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{WorkflowFilter, WorkflowStore};

#[derive(Default)]
struct MemoryState {
    workflows: HashMap<Uuid, WorkflowInstance>,
    steps: HashMap<Uuid, StepInstance>,
    events: HashMap<Uuid, WorkflowEvent>,
}

impl MemoryState {
    /// Steps of one workflow, cloned and ordered by execution order.
    fn steps_of(&self, workflow_inst_id: Uuid) -> Vec<StepInstance> {
        let mut steps: Vec<StepInstance> = self
            .steps
            .values()
            .filter(|s| s.workflow_inst_id == workflow_inst_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.execution_order);
        steps
    }
}

/// In-memory [`WorkflowStore`] implementation.
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowStore for InMemoryStore {
    async fn save_workflow(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.workflows.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let state = self.state.read().await;
        let mut instance = state.workflows.get(&id).cloned().ok_or(StoreError::NotFound)?;
        instance.steps = state.steps_of(id);
        Ok(instance)
    }

    async fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let instance = state.workflows.get_mut(&id).ok_or(StoreError::NotFound)?;
        instance.status = status;
        instance.completed_at = if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };
        Ok(())
    }

    async fn update_workflow_output(
        &self,
        id: Uuid,
        output: &HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let instance = state.workflows.get_mut(&id).ok_or(StoreError::NotFound)?;
        instance.output = output.clone();
        Ok(())
    }

    async fn update_workflow_error(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let instance = state.workflows.get_mut(&id).ok_or(StoreError::NotFound)?;
        instance.error = Some(error.to_string());
        instance.status = WorkflowStatus::Failed;
        instance.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowInstance>, u64), StoreError> {
        let state = self.state.read().await;
        let mut matches: Vec<WorkflowInstance> = state
            .workflows
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let total = matches.len() as u64;
        let page: Vec<WorkflowInstance> =
            matches.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn save_step(&self, step: &StepInstance) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<StepInstance, StoreError> {
        let state = self.state.read().await;
        state.steps.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn get_workflow_steps(
        &self,
        workflow_inst_id: Uuid,
    ) -> Result<Vec<StepInstance>, StoreError> {
        let state = self.state.read().await;
        Ok(state.steps_of(workflow_inst_id))
    }

    async fn update_step_status(&self, id: Uuid, status: StepStatus) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let step = state.steps.get_mut(&id).ok_or(StoreError::NotFound)?;
        step.status = status;
        if status == StepStatus::Running {
            step.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            step.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_step_output(
        &self,
        id: Uuid,
        output: &HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let step = state.steps.get_mut(&id).ok_or(StoreError::NotFound)?;
        step.output = output.clone();
        Ok(())
    }

    async fn update_step_error(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let step = state.steps.get_mut(&id).ok_or(StoreError::NotFound)?;
        step.error = Some(error.to_string());
        step.status = StepStatus::Failed;
        step.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn save_event(&self, event: &WorkflowEvent) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_workflow_events(
        &self,
        workflow_inst_id: Uuid,
    ) -> Result<Vec<WorkflowEvent>, StoreError> {
        let state = self.state.read().await;
        let mut events: Vec<WorkflowEvent> = state
            .events
            .values()
            .filter(|e| e.workflow_inst_id == workflow_inst_id)
            .cloned()
            .collect();
        // UUIDv7 IDs break timestamp ties in emission order.
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn with_transaction<F, Fut, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        // The single lock already serializes each write; there is no
        // multi-statement atomicity to add.
        f().await
    }
}
