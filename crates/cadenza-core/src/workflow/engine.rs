//! Engine facade: registration, blocking and detached starts, resumption,
//! queries, and caller-driven compensation.
//!
//! The scheduling loop drives one workflow instance: it selects ready waves
//! (all dependencies terminal and satisfied), runs sequential steps one by
//! one in priority order, then dispatches the parallel-eligible set onto a
//! `tokio::task::JoinSet`. Every parallel task owns its step instance and
//! runs the full attempt loop independently; completions are merged back on
//! the loop task as the join set drains, so per-step mutation never needs a
//! shared lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use cadenza_types::config::EngineConfig;
use cadenza_types::error::{EngineError, StoreError};
use cadenza_types::workflow::{
    StepInstance, StepStatus, WorkflowEvent, WorkflowInstance, WorkflowResult, WorkflowStatus,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::{self, EventBus};
use crate::store::{WorkflowFilter, WorkflowStore};

use super::definition::{validate_definition, StepFailure, WorkflowDefinition};
use super::scheduler;
use super::step_runner::{assemble_step_input, StepOutcome, StepRunner};

/// How the scheduling loop ended, before terminal persistence.
enum RunOutcome {
    Completed,
    Cancelled,
}

/// Workflow orchestration engine over a pluggable store.
///
/// Cheap to clone: the store, definition registry, event bus, and
/// detached-worker semaphore are all shared behind `Arc`s. A single engine
/// may drive many workflows concurrently.
pub struct Engine<S> {
    store: Arc<S>,
    definitions: Arc<RwLock<HashMap<String, Arc<WorkflowDefinition>>>>,
    events: EventBus,
    detached_slots: Arc<Semaphore>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            definitions: Arc::clone(&self.definitions),
            events: self.events.clone(),
            detached_slots: Arc::clone(&self.detached_slots),
        }
    }
}

impl<S: WorkflowStore + 'static> Engine<S> {
    /// Create an engine with default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self {
            store: Arc::new(store),
            definitions: Arc::new(RwLock::new(HashMap::new())),
            events: EventBus::new(config.event_capacity),
            detached_slots: Arc::new(Semaphore::new(config.detached_workers)),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Subscribe to the live lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Validate and register a definition. A duplicate ID silently replaces
    /// the previous definition.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        validate_definition(&definition)?;
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Look up a registered definition.
    pub async fn get_definition(&self, id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.definitions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Start / resume
    // -----------------------------------------------------------------------

    /// Start a workflow and drive it to a terminal state on the caller's
    /// scope.
    ///
    /// A workflow-level failure (a required step exhausted its attempts, or
    /// the scope was cancelled) is an `Ok` result with `success == false`;
    /// `Err` is reserved for infrastructure problems (unknown definition,
    /// store failures).
    pub async fn start_workflow(
        &self,
        token: CancellationToken,
        workflow_id: &str,
        input: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> Result<WorkflowResult, EngineError> {
        let definition = self.get_definition(workflow_id).await?;
        let instance = self.new_instance(workflow_id, input, metadata);
        self.store.save_workflow(&instance).await?;
        self.emit_workflow(
            instance.id,
            "workflow.started",
            HashMap::from([("workflow_id".to_string(), json!(workflow_id))]),
        )
        .await;

        self.run_instance(token, definition, instance).await
    }

    /// Start a workflow detached: the scheduling loop runs on a background
    /// task with a fresh root scope, and the new instance ID is returned
    /// immediately. Poll [`Engine::get_workflow_status`] (or subscribe to
    /// the event stream) for completion.
    ///
    /// Concurrent detached workflows are bounded by
    /// [`EngineConfig::detached_workers`]; excess starts queue for a slot.
    pub async fn start_workflow_async(
        &self,
        workflow_id: &str,
        input: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let definition = self.get_definition(workflow_id).await?;
        let instance = self.new_instance(workflow_id, input, metadata);
        let instance_id = instance.id;
        self.store.save_workflow(&instance).await?;
        self.emit_workflow(
            instance_id,
            "workflow.started",
            HashMap::from([("workflow_id".to_string(), json!(workflow_id))]),
        )
        .await;

        let engine = self.clone();
        let slots = Arc::clone(&self.detached_slots);
        tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore only closes when the engine is torn down.
                Err(_) => return,
            };
            let token = CancellationToken::new();
            if let Err(error) = engine.run_instance(token, definition, instance).await {
                tracing::error!(
                    instance = %instance_id,
                    %error,
                    "detached workflow terminated with error"
                );
            }
        });

        Ok(instance_id)
    }

    /// Resume a previously started instance.
    ///
    /// Completed and cancelled instances report their stored result as-is.
    /// A failed instance is re-driven: its failed steps get a fresh attempt
    /// budget and the instance-level retry counter advances. Anything else
    /// re-enters the scheduling loop, which skips steps already in a
    /// terminal state.
    pub async fn resume_workflow(
        &self,
        token: CancellationToken,
        instance_id: Uuid,
    ) -> Result<WorkflowResult, EngineError> {
        let mut instance = self.load_instance(instance_id).await?;

        match instance.status {
            WorkflowStatus::Completed | WorkflowStatus::Cancelled => {
                let duration = (Utc::now() - instance.started_at).to_std().unwrap_or_default();
                return Ok(WorkflowResult {
                    success: instance.status == WorkflowStatus::Completed,
                    output: instance.output.clone(),
                    error: instance.error.clone(),
                    duration,
                    instance,
                });
            }
            WorkflowStatus::Failed => {
                for step in instance
                    .steps
                    .iter_mut()
                    .filter(|s| s.status == StepStatus::Failed)
                {
                    step.status = StepStatus::Pending;
                    step.output = HashMap::new();
                    step.error = None;
                    step.started_at = None;
                    step.completed_at = None;
                    step.retry_count = 0;
                    step.last_retry_at = None;
                    step.duration_ms = 0;
                }
                for step in &instance.steps {
                    if step.status == StepStatus::Pending {
                        self.store.save_step(step).await?;
                    }
                }
                instance.status = WorkflowStatus::Retrying;
                instance.retry_count += 1;
                instance.last_retry_at = Some(Utc::now());
                instance.error = None;
                instance.completed_at = None;
                self.store.save_workflow(&instance).await?;
            }
            _ => {}
        }

        let definition = self.get_definition(&instance.workflow_id).await?;
        tracing::info!(
            instance = %instance_id,
            workflow = instance.workflow_id.as_str(),
            "resuming workflow execution"
        );
        self.run_instance(token, definition, instance).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current state of an instance, steps eagerly loaded.
    pub async fn get_workflow_status(
        &self,
        instance_id: Uuid,
    ) -> Result<WorkflowInstance, EngineError> {
        self.load_instance(instance_id).await
    }

    /// List instances matching `filter`, paginated; also returns the total
    /// match count.
    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowInstance>, u64), EngineError> {
        Ok(self.store.list_workflows(filter, limit, offset).await?)
    }

    // -----------------------------------------------------------------------
    // Compensation
    // -----------------------------------------------------------------------

    /// Invoke compensators for an instance's completed steps in reverse
    /// execution order, passing each step's recorded output.
    ///
    /// The engine never schedules this automatically: it is the
    /// caller-driven rollback half of the saga pattern. Compensator
    /// failures are collected and returned rather than aborting the sweep.
    pub async fn compensate(
        &self,
        token: &CancellationToken,
        instance_id: Uuid,
    ) -> Result<Vec<(String, StepFailure)>, EngineError> {
        let instance = self.load_instance(instance_id).await?;
        let definition = self.get_definition(&instance.workflow_id).await?;

        let mut completed: Vec<&StepInstance> = instance
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.execution_order.cmp(&a.execution_order));

        let mut failures = Vec::new();
        for step in completed {
            let Some(step_def) = definition.step(&step.step_id) else {
                continue;
            };
            let Some(compensator) = &step_def.compensator else {
                continue;
            };
            tracing::debug!(
                instance = %instance_id,
                step = step.step_id.as_str(),
                "running compensator"
            );
            if let Err(failure) = compensator(token.clone(), step.output.clone()).await {
                tracing::warn!(
                    instance = %instance_id,
                    step = step.step_id.as_str(),
                    error = %failure,
                    "compensator failed"
                );
                failures.push((step.step_id.clone(), failure));
            }
        }
        Ok(failures)
    }

    // -----------------------------------------------------------------------
    // Execution loop
    // -----------------------------------------------------------------------

    async fn run_instance(
        &self,
        token: CancellationToken,
        definition: Arc<WorkflowDefinition>,
        mut instance: WorkflowInstance,
    ) -> Result<WorkflowResult, EngineError> {
        let run_start = Instant::now();
        tracing::info!(
            instance = %instance.id,
            workflow = definition.id.as_str(),
            "starting workflow execution"
        );

        instance.status = WorkflowStatus::Running;
        self.store
            .update_workflow_status(instance.id, WorkflowStatus::Running)
            .await?;

        if instance.steps.is_empty() {
            // First execution: create one step instance per definition step.
            for (order, step_def) in definition.steps.iter().enumerate() {
                let step = StepInstance {
                    id: Uuid::now_v7(),
                    step_id: step_def.id.clone(),
                    workflow_inst_id: instance.id,
                    status: StepStatus::Pending,
                    input: HashMap::new(),
                    output: HashMap::new(),
                    started_at: None,
                    completed_at: None,
                    error: None,
                    retry_count: 0,
                    last_retry_at: None,
                    duration_ms: 0,
                    execution_order: order,
                    priority: step_def.priority,
                };
                self.store.save_step(&step).await?;
                instance.steps.push(step);
            }
        } else if instance.context.is_empty() {
            // Resumed instance: rebuild the accumulated context from the
            // persisted outputs of steps that already completed.
            let mut done: Vec<StepInstance> = instance
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .cloned()
                .collect();
            done.sort_by_key(|s| s.execution_order);
            for step in done {
                merge_step_output(&mut instance, &step.step_id, step.output.clone());
            }
        }

        match self.execute_steps(&token, &definition, &mut instance).await {
            Ok(RunOutcome::Completed) => {
                instance.status = WorkflowStatus::Completed;
                instance.completed_at = Some(Utc::now());
                self.store
                    .update_workflow_status(instance.id, WorkflowStatus::Completed)
                    .await?;
                self.store
                    .update_workflow_output(instance.id, &instance.output)
                    .await?;
                self.emit_workflow(
                    instance.id,
                    "workflow.completed",
                    HashMap::from([(
                        "duration_ms".to_string(),
                        json!(run_start.elapsed().as_millis() as u64),
                    )]),
                )
                .await;
                tracing::info!(instance = %instance.id, "workflow completed");
                Ok(WorkflowResult {
                    success: true,
                    output: instance.output.clone(),
                    error: None,
                    duration: run_start.elapsed(),
                    instance,
                })
            }
            Ok(RunOutcome::Cancelled) => {
                instance.status = WorkflowStatus::Cancelled;
                instance.completed_at = Some(Utc::now());
                self.store
                    .update_workflow_status(instance.id, WorkflowStatus::Cancelled)
                    .await?;
                tracing::info!(instance = %instance.id, "workflow cancelled");
                Ok(WorkflowResult {
                    success: false,
                    output: HashMap::new(),
                    error: Some("workflow cancelled".to_string()),
                    duration: run_start.elapsed(),
                    instance,
                })
            }
            Err(EngineError::StepFailed { step_id, error }) => {
                instance.status = WorkflowStatus::Failed;
                instance.error = Some(error.clone());
                instance.completed_at = Some(Utc::now());
                // Persists the failing step's raw message and transitions
                // the stored instance to failed in one operation.
                self.store.update_workflow_error(instance.id, &error).await?;
                self.emit_workflow(
                    instance.id,
                    "workflow.failed",
                    HashMap::from([("error".to_string(), json!(error))]),
                )
                .await;
                tracing::warn!(
                    instance = %instance.id,
                    step = step_id.as_str(),
                    error = error.as_str(),
                    "workflow failed"
                );
                Ok(WorkflowResult {
                    success: false,
                    output: HashMap::new(),
                    error: Some(error),
                    duration: run_start.elapsed(),
                    instance,
                })
            }
            Err(other) => Err(other),
        }
    }

    async fn execute_steps(
        &self,
        token: &CancellationToken,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
    ) -> Result<RunOutcome, EngineError> {
        let runner = StepRunner::new(Arc::clone(&self.store), self.events.clone());

        loop {
            if token.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let statuses: HashMap<String, StepStatus> = instance
                .steps
                .iter()
                .map(|s| (s.step_id.clone(), s.status))
                .collect();
            let ready = scheduler::ready_steps(definition, &statuses);
            if ready.is_empty() {
                if instance.steps.iter().all(|s| s.status.is_terminal()) {
                    return Ok(RunOutcome::Completed);
                }
                return Err(EngineError::NoProgress);
            }

            let (sequential, parallel) = scheduler::partition(ready);
            tracing::debug!(
                instance = %instance.id,
                sequential = sequential.len(),
                parallel = parallel.len(),
                "scheduling wave"
            );

            let mut progressed = false;

            for step_def in sequential {
                let Some(idx) = instance.steps.iter().position(|s| s.step_id == step_def.id)
                else {
                    continue;
                };
                let input = assemble_step_input(step_def, instance);
                let (step, result) = runner
                    .run(token, step_def, instance.steps[idx].clone(), input)
                    .await;
                progressed |= step.is_terminal();
                instance.steps[idx] = step;
                match result {
                    Ok(StepOutcome::Completed(output)) => {
                        merge_step_output(instance, &step_def.id, output);
                    }
                    Ok(StepOutcome::Skipped) => {}
                    Err(e) => return Err(e),
                }
            }

            if !parallel.is_empty() {
                let mut tasks: JoinSet<(String, StepInstance, Result<StepOutcome, EngineError>)> =
                    JoinSet::new();
                for step_def in &parallel {
                    let Some(idx) = instance.steps.iter().position(|s| s.step_id == step_def.id)
                    else {
                        continue;
                    };
                    let input = assemble_step_input(step_def, instance);
                    let step = instance.steps[idx].clone();
                    let step_def = (*step_def).clone();
                    let runner = runner.clone();
                    let token = token.clone();
                    tasks.spawn(async move {
                        let (step, result) = runner.run(&token, &step_def, step, input).await;
                        (step_def.id, step, result)
                    });
                }

                // Siblings run to completion even when one fails; the wave's
                // aggregated result is the first observed required failure.
                let mut wave_failure: Option<EngineError> = None;
                while let Some(joined) = tasks.join_next().await {
                    let (step_id, step, result) = joined
                        .map_err(|e| EngineError::Execution(format!("task join error: {e}")))?;
                    if let Some(idx) = instance.steps.iter().position(|s| s.step_id == step_id) {
                        instance.steps[idx] = step;
                    }
                    progressed = true;
                    match result {
                        Ok(StepOutcome::Completed(output)) => {
                            merge_step_output(instance, &step_id, output);
                        }
                        Ok(StepOutcome::Skipped) => {}
                        Err(e) => {
                            wave_failure.get_or_insert(e);
                        }
                    }
                }
                if let Some(failure) = wave_failure {
                    return Err(failure);
                }
            }

            if !progressed {
                return Err(EngineError::NoProgress);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn new_instance(
        &self,
        workflow_id: &str,
        input: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> WorkflowInstance {
        let trace_id = string_field(&metadata, "trace_id")
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let correlation_id = string_field(&metadata, "correlation_id")
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let business_id = string_field(&metadata, "business_id").unwrap_or_default();

        WorkflowInstance {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Pending,
            input,
            output: HashMap::new(),
            context: HashMap::new(),
            current_step_id: None,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            retry_count: 0,
            last_retry_at: None,
            metadata,
            trace_id,
            correlation_id,
            business_id,
        }
    }

    async fn load_instance(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.store.get_workflow(id).await.map_err(|e| match e {
            StoreError::NotFound => EngineError::InstanceNotFound(id),
            other => EngineError::Store(other),
        })
    }

    async fn emit_workflow(
        &self,
        instance_id: Uuid,
        event_type: &str,
        event_data: HashMap<String, Value>,
    ) {
        event::emit(
            self.store.as_ref(),
            &self.events,
            instance_id,
            None,
            event_type,
            event_data,
        )
        .await;
    }
}

/// Merge a completed step's output into the workflow: the whole mapping
/// nests into `context` under the step's ID, and each key flattens into both
/// `context` and `output` (last writer wins).
fn merge_step_output(
    instance: &mut WorkflowInstance,
    step_id: &str,
    output: HashMap<String, Value>,
) {
    instance.context.insert(
        step_id.to_string(),
        Value::Object(output.clone().into_iter().collect()),
    );
    for (key, value) in &output {
        instance.context.insert(key.clone(), value.clone());
    }
    for (key, value) in output {
        instance.output.insert(key, value);
    }
}

fn string_field(map: &HashMap<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
