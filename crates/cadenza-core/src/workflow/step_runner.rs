//! Per-step attempt loop: input assembly, timeout, backoff, retry gating,
//! and event emission.
//!
//! Each run owns its `StepInstance` and returns it with the outcome; the
//! engine merges completions back into the workflow, so parallel tasks never
//! share mutable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use cadenza_types::error::EngineError;
use cadenza_types::workflow::{StepInstance, StepStatus, WorkflowInstance};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::event::{self, EventBus};
use crate::store::WorkflowStore;

use super::definition::{StepDefinition, StepInput, StepOutput};

/// What a finished step run means to the scheduler.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    /// The step completed; merge this output downstream.
    Completed(StepOutput),
    /// A non-required step failed and was marked skipped; dependents stay
    /// unblocked but receive no output from it.
    Skipped,
}

/// Drives individual step attempts against the store and event bus.
pub(crate) struct StepRunner<S> {
    store: Arc<S>,
    events: EventBus,
}

impl<S> Clone for StepRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: self.events.clone(),
        }
    }
}

impl<S: WorkflowStore> StepRunner<S> {
    pub fn new(store: Arc<S>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Run the full attempt loop for one step.
    ///
    /// Takes ownership of the step instance and returns it in its final
    /// state alongside the outcome. A required-step failure is the
    /// `EngineError::StepFailed` variant; store failures bubble as-is.
    pub async fn run(
        &self,
        token: &CancellationToken,
        step: &StepDefinition,
        mut instance: StepInstance,
        input: StepInput,
    ) -> (StepInstance, Result<StepOutcome, EngineError>) {
        let result = self.drive(token, step, &mut instance, input).await;
        (instance, result)
    }

    async fn drive(
        &self,
        token: &CancellationToken,
        step: &StepDefinition,
        instance: &mut StepInstance,
        input: StepInput,
    ) -> Result<StepOutcome, EngineError> {
        let max_attempts = step.retry_policy.as_ref().map_or(1, |p| p.max_attempts.max(1));
        instance.input = input.clone();

        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = step
                    .retry_policy
                    .as_ref()
                    .map(|p| p.interval_for(attempt))
                    .unwrap_or_default();
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => break,
                    }
                }

                instance.status = StepStatus::Retrying;
                instance.retry_count = attempt;
                instance.last_retry_at = Some(Utc::now());
                self.store
                    .update_step_status(instance.id, StepStatus::Retrying)
                    .await?;
                self.emit(
                    instance,
                    "step.retry",
                    HashMap::from([("attempt".to_string(), json!(attempt + 1))]),
                )
                .await;
                tracing::debug!(
                    step = step.id.as_str(),
                    attempt = attempt + 1,
                    "retrying step"
                );
            } else {
                instance.status = StepStatus::Running;
                instance.started_at = Some(Utc::now());
                self.store
                    .update_step_status(instance.id, StepStatus::Running)
                    .await?;
                self.emit(
                    instance,
                    "step.started",
                    HashMap::from([("step_id".to_string(), json!(step.id))]),
                )
                .await;
            }

            // A positive timeout gets its own child scope so the attempt is
            // cancelled when the deadline passes; otherwise the attempt runs
            // under the caller's scope.
            let attempt_token = if step.timeout.is_zero() {
                token.clone()
            } else {
                token.child_token()
            };

            let started = Instant::now();
            let attempt_future = (step.executor)(attempt_token.clone(), input.clone());
            let result = if step.timeout.is_zero() {
                attempt_future.await
            } else {
                match tokio::time::timeout(step.timeout, attempt_future).await {
                    Ok(result) => result,
                    Err(_) => {
                        attempt_token.cancel();
                        Err("step timed out".into())
                    }
                }
            };
            instance.duration_ms = started.elapsed().as_millis() as i64;

            match result {
                Ok(output) => {
                    instance.status = StepStatus::Completed;
                    instance.output = output.clone();
                    instance.completed_at = Some(Utc::now());
                    self.store
                        .update_step_status(instance.id, StepStatus::Completed)
                        .await?;
                    self.store.update_step_output(instance.id, &output).await?;
                    self.emit(
                        instance,
                        "step.completed",
                        HashMap::from([("duration_ms".to_string(), json!(instance.duration_ms))]),
                    )
                    .await;
                    return Ok(StepOutcome::Completed(output));
                }
                Err(failure) => {
                    last_error = failure.message;
                    // A cancelled caller scope would just re-run the executor
                    // under the same dead scope.
                    if token.is_cancelled() {
                        break;
                    }
                    if let Some(policy) = &step.retry_policy {
                        if !policy.is_retryable(&last_error) {
                            break;
                        }
                    }
                }
            }
        }

        instance.status = StepStatus::Failed;
        instance.error = Some(last_error.clone());
        instance.completed_at = Some(Utc::now());
        self.store.update_step_error(instance.id, &last_error).await?;
        self.emit(
            instance,
            "step.failed",
            HashMap::from([
                ("error".to_string(), json!(last_error)),
                ("retries".to_string(), json!(instance.retry_count)),
            ]),
        )
        .await;

        if step.required {
            tracing::warn!(step = step.id.as_str(), error = last_error.as_str(), "required step failed");
            Err(EngineError::StepFailed {
                step_id: step.id.clone(),
                error: last_error,
            })
        } else {
            instance.status = StepStatus::Skipped;
            self.store
                .update_step_status(instance.id, StepStatus::Skipped)
                .await?;
            tracing::debug!(step = step.id.as_str(), "optional step failed; marked skipped");
            Ok(StepOutcome::Skipped)
        }
    }

    async fn emit(
        &self,
        instance: &StepInstance,
        event_type: &str,
        event_data: HashMap<String, Value>,
    ) {
        event::emit(
            self.store.as_ref(),
            &self.events,
            instance.workflow_inst_id,
            Some(instance.id),
            event_type,
            event_data,
        )
        .await;
    }
}

/// Assemble a step's input by overlaying, in order: the workflow input, each
/// dependency's output (flattened, plus nested under the dependency's step
/// ID), and the accumulated workflow context. Last writer wins; this
/// ordering is part of the contract.
pub(crate) fn assemble_step_input(
    step: &StepDefinition,
    instance: &WorkflowInstance,
) -> StepInput {
    let mut input = instance.input.clone();

    for dep_id in &step.dependencies {
        if let Some(dep) = instance.steps.iter().find(|s| &s.step_id == dep_id) {
            for (k, v) in &dep.output {
                input.insert(k.clone(), v.clone());
            }
            input.insert(
                dep_id.clone(),
                Value::Object(dep.output.clone().into_iter().collect()),
            );
        }
    }

    for (k, v) in &instance.context {
        input.insert(k.clone(), v.clone());
    }

    input
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::workflow::definition::{RetryPolicy, StepExecutor};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn runner() -> StepRunner<InMemoryStore> {
        StepRunner::new(Arc::new(InMemoryStore::new()), EventBus::new(64))
    }

    fn step_with(executor: StepExecutor) -> StepDefinition {
        StepDefinition {
            id: "work".to_string(),
            name: "Work".to_string(),
            description: String::new(),
            executor,
            compensator: None,
            dependencies: vec![],
            retry_policy: None,
            timeout: Duration::ZERO,
            required: true,
            parallel: false,
            priority: 0,
        }
    }

    fn pending_instance() -> StepInstance {
        StepInstance {
            id: Uuid::now_v7(),
            step_id: "work".to_string(),
            workflow_inst_id: Uuid::now_v7(),
            status: StepStatus::Pending,
            input: HashMap::new(),
            output: HashMap::new(),
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            last_retry_at: None,
            duration_ms: 0,
            execution_order: 0,
            priority: 0,
        }
    }

    async fn run_step(
        runner: &StepRunner<InMemoryStore>,
        step: &StepDefinition,
    ) -> (StepInstance, Result<StepOutcome, EngineError>) {
        let instance = pending_instance();
        runner.store.save_step(&instance).await.unwrap();
        runner
            .run(&CancellationToken::new(), step, instance, HashMap::new())
            .await
    }

    fn fail_n_times(failures: u32) -> StepExecutor {
        let calls = Arc::new(AtomicU32::new(0));
        Arc::new(move |_token, _input| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err("transient".into())
                } else {
                    Ok(HashMap::from([("done".to_string(), json!(true))]))
                }
            })
        })
    }

    #[tokio::test]
    async fn first_try_success_has_zero_retries() {
        let runner = runner();
        let step = step_with(fail_n_times(0));
        let (instance, result) = run_step(&runner, &step).await;

        assert!(matches!(result, Ok(StepOutcome::Completed(_))));
        assert_eq!(instance.status, StepStatus::Completed);
        assert_eq!(instance.retry_count, 0);
        assert!(instance.started_at.is_some());
        assert!(instance.completed_at.is_some());
    }

    #[tokio::test]
    async fn no_policy_means_single_attempt() {
        let runner = runner();
        let calls = Arc::new(AtomicU32::new(0));
        let counting: StepExecutor = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_t, _i| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("boom".into())
                })
            })
        };
        let step = step_with(counting);
        let (instance, result) = run_step(&runner, &step).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(EngineError::StepFailed { .. })));
        assert_eq!(instance.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn retries_until_success_within_policy() {
        let runner = runner();
        let mut step = step_with(fail_n_times(2));
        step.retry_policy = Some(RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(10),
            multiplier: 2.0,
            retryable_errors: vec![],
        });
        let (instance, result) = run_step(&runner, &step).await;

        assert!(matches!(result, Ok(StepOutcome::Completed(_))));
        assert_eq!(instance.retry_count, 2);
        assert!(instance.last_retry_at.is_some());
    }

    #[tokio::test]
    async fn non_retryable_message_stops_early() {
        let runner = runner();
        let calls = Arc::new(AtomicU32::new(0));
        let executor: StepExecutor = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_t, _i| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("invalid credentials".into())
                })
            })
        };
        let mut step = step_with(executor);
        step.retry_policy = Some(RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            retryable_errors: vec!["timeout".to_string()],
        });
        let (instance, result) = run_step(&runner, &step).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1, "must not retry");
        assert!(matches!(result, Err(EngineError::StepFailed { .. })));
        assert_eq!(instance.error.as_deref(), Some("invalid credentials"));
    }

    #[tokio::test]
    async fn optional_failure_becomes_skipped() {
        let runner = runner();
        let mut step = step_with(Arc::new(|_t, _i| {
            Box::pin(async { Err("not critical".into()) })
        }));
        step.required = false;
        let (instance, result) = run_step(&runner, &step).await;

        assert!(matches!(result, Ok(StepOutcome::Skipped)));
        assert_eq!(instance.status, StepStatus::Skipped);
        assert_eq!(instance.error.as_deref(), Some("not critical"));

        let stored = runner.store.get_step(instance.id).await.unwrap();
        assert_eq!(stored.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn timeout_fails_the_attempt() {
        let runner = runner();
        let executor: StepExecutor = Arc::new(|_token, _i| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(StepOutput::new())
            })
        });
        let mut step = step_with(executor);
        step.timeout = Duration::from_millis(20);
        let (instance, result) = run_step(&runner, &step).await;

        assert!(matches!(result, Err(EngineError::StepFailed { .. })));
        assert_eq!(instance.error.as_deref(), Some("step timed out"));
        assert!(instance.duration_ms >= 15);
    }

    #[tokio::test]
    async fn cancelled_scope_is_not_retried() {
        let runner = runner();
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        token.cancel();

        let executor: StepExecutor = {
            let calls = Arc::clone(&calls);
            Arc::new(move |token, _i| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if token.is_cancelled() {
                        Err("cancelled".into())
                    } else {
                        Ok(StepOutput::new())
                    }
                })
            })
        };
        let mut step = step_with(executor);
        step.retry_policy = Some(RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            retryable_errors: vec![],
        });

        let instance = pending_instance();
        runner.store.save_step(&instance).await.unwrap();
        let (instance, result) = runner.run(&token, &step, instance, HashMap::new()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1, "cancellation must not retry");
        assert!(matches!(result, Err(EngineError::StepFailed { .. })));
        assert_eq!(instance.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn events_follow_started_retry_failed_order() {
        let runner = runner();
        let mut step = step_with(Arc::new(|_t, _i| Box::pin(async { Err("flaky".into()) })));
        step.retry_policy = Some(RetryPolicy {
            max_attempts: 2,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            retryable_errors: vec![],
        });
        let (instance, _) = run_step(&runner, &step).await;

        let events = runner
            .store
            .get_workflow_events(instance.workflow_inst_id)
            .await
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["step.started", "step.retry", "step.failed"]);
        assert_eq!(events[1].event_data["attempt"], json!(2));
        assert_eq!(events[2].event_data["retries"], json!(1));
    }

    // -----------------------------------------------------------------------
    // Input assembly
    // -----------------------------------------------------------------------

    fn instance_with_steps(steps: Vec<StepInstance>) -> WorkflowInstance {
        WorkflowInstance {
            id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            status: cadenza_types::workflow::WorkflowStatus::Running,
            input: HashMap::from([("seed".to_string(), json!(1))]),
            output: HashMap::new(),
            context: HashMap::new(),
            current_step_id: None,
            steps,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            retry_count: 0,
            last_retry_at: None,
            metadata: HashMap::new(),
            trace_id: String::new(),
            correlation_id: String::new(),
            business_id: String::new(),
        }
    }

    fn completed_step(step_id: &str, output: StepOutput) -> StepInstance {
        let mut s = pending_instance();
        s.step_id = step_id.to_string();
        s.status = StepStatus::Completed;
        s.output = output;
        s
    }

    #[test]
    fn input_overlays_workflow_input_then_deps_then_context() {
        let mut workflow = instance_with_steps(vec![completed_step(
            "fetch",
            HashMap::from([("seed".to_string(), json!(2)), ("rows".to_string(), json!(10))]),
        )]);
        workflow
            .context
            .insert("rows".to_string(), json!(99));

        let mut step = step_with(Arc::new(|_t, _i| Box::pin(async { Ok(StepOutput::new()) })));
        step.dependencies = vec!["fetch".to_string()];

        let input = assemble_step_input(&step, &workflow);
        // Dependency output wins over workflow input; context wins over both.
        assert_eq!(input["seed"], json!(2));
        assert_eq!(input["rows"], json!(99));
        // The whole dependency output also nests under its step ID.
        assert_eq!(input["fetch"]["seed"], json!(2));
        assert_eq!(input["fetch"]["rows"], json!(10));
    }

    #[test]
    fn skipped_dependency_contributes_no_flattened_keys() {
        let mut skipped = completed_step("opt", StepOutput::new());
        skipped.status = StepStatus::Skipped;
        let workflow = instance_with_steps(vec![skipped]);

        let mut step = step_with(Arc::new(|_t, _i| Box::pin(async { Ok(StepOutput::new()) })));
        step.dependencies = vec!["opt".to_string()];

        let input = assemble_step_input(&step, &workflow);
        assert_eq!(input["seed"], json!(1));
        assert_eq!(input["opt"], json!({}));
    }
}
