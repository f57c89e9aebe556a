//! Ready-step selection, priority ordering, and wave partitioning.
//!
//! Pure functions over a definition and the current step statuses; the
//! engine calls them once per scheduling wave. A step is ready when it is
//! still pending and every dependency has reached a state that satisfies
//! dependents (`completed` or `skipped`). Ready steps are ordered by
//! descending priority; the sort is stable, so equal priorities keep
//! definition order, but callers must not rely on that tie-break.

use std::collections::HashMap;

use cadenza_types::workflow::StepStatus;

use super::definition::{StepDefinition, WorkflowDefinition};

/// Select the ready wave, ordered by descending priority.
pub fn ready_steps<'a>(
    definition: &'a WorkflowDefinition,
    statuses: &HashMap<String, StepStatus>,
) -> Vec<&'a StepDefinition> {
    let mut ready: Vec<&StepDefinition> = definition
        .steps
        .iter()
        .filter(|step| {
            statuses.get(step.id.as_str()).copied() == Some(StepStatus::Pending)
                && step.dependencies.iter().all(|dep| {
                    statuses
                        .get(dep.as_str())
                        .is_some_and(|s| s.satisfies_dependents())
                })
        })
        .collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority));
    ready
}

/// Split an ordered ready wave into (sequential, parallel-eligible) lists,
/// preserving the priority order within each.
pub fn partition<'a>(
    ready: Vec<&'a StepDefinition>,
) -> (Vec<&'a StepDefinition>, Vec<&'a StepDefinition>) {
    ready.into_iter().partition(|step| !step.parallel)
}
