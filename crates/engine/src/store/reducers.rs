//! Sub-reducers composed by [`super::WorkflowDocumentStore::dispatch`].
//!
//! Validation runs before any reducer so that a rejected action leaves every slice untouched.

use flowsync_types::{PersistedStepState, StepExecution, WorkflowDefinition};

use super::actions::StoreAction;
use super::{StoreError, StoreState, SyncState};

pub(super) fn reduce(state: &mut StoreState, action: &StoreAction) -> Result<(), StoreError> {
    validate(&state.workflow, action)?;
    reduce_definition(&mut state.workflow, &state.sync, action);
    reduce_step_state(&mut state.step_state, action);
    reduce_sync(&mut state.sync, action);
    Ok(())
}

fn validate(workflow: &WorkflowDefinition, action: &StoreAction) -> Result<(), StoreError> {
    match action {
        StoreAction::AddStep(step) if workflow.step(step.name()).is_some() => Err(StoreError::DuplicateStep {
            name: step.name().to_string(),
        }),
        StoreAction::AddStep(step) if step.name().trim().is_empty() => Err(StoreError::EmptyStepName),
        StoreAction::UpdateStep { update, .. } if update.rename.as_deref().is_some_and(|name| name.trim().is_empty()) => {
            Err(StoreError::EmptyStepName)
        }
        StoreAction::UpdateStep { name, update } => {
            ensure_step(workflow, name)?;
            match &update.rename {
                Some(new_name) if new_name != name && workflow.step(new_name).is_some() => {
                    Err(StoreError::DuplicateStep { name: new_name.clone() })
                }
                _ => Ok(()),
            }
        }
        StoreAction::AddStep(_) => Ok(()),
        other => match other.step_name() {
            Some(name) => ensure_step(workflow, name),
            None => Ok(()),
        },
    }
}

fn ensure_step(workflow: &WorkflowDefinition, name: &str) -> Result<(), StoreError> {
    match workflow.step(name) {
        Some(_) => Ok(()),
        None => Err(StoreError::StepNotFound { name: name.to_string() }),
    }
}

fn reduce_definition(workflow: &mut WorkflowDefinition, sync: &SyncState, action: &StoreAction) {
    match action {
        StoreAction::Load(definition)
        | StoreAction::UpdateWorkflow(definition)
        | StoreAction::MarkSaved(definition)
        | StoreAction::ApplyServerUpdate(definition) => *workflow = definition.clone(),
        StoreAction::AddStep(step) => workflow.steps.push(step.clone()),
        StoreAction::UpdateStep { name, update } => {
            if let Some(step) = workflow.step_mut(name) {
                update.apply_to(step);
            }
        }
        StoreAction::RemoveStep { name } => workflow.steps.retain(|step| step.name() != name),
        StoreAction::AcceptPendingUpdate => {
            if let Some(pending) = &sync.pending_server_update {
                *workflow = pending.clone();
            }
        }
        _ => {}
    }
}

fn reduce_step_state(step_state: &mut PersistedStepState, action: &StoreAction) {
    match action {
        StoreAction::UpdateStep { name, update } => {
            if let Some(new_name) = &update.rename
                && new_name != name
            {
                // The edited input is discarded; run artifacts follow the step to its new name.
                step_state.step_inputs.shift_remove(name);
                if let Some(output) = step_state.step_outputs.shift_remove(name) {
                    step_state.step_outputs.insert(new_name.clone(), output);
                }
                if let Some(execution) = step_state.step_executions.shift_remove(name) {
                    step_state.step_executions.insert(new_name.clone(), execution);
                }
            }
        }
        StoreAction::RemoveStep { name } => step_state.forget_step(name),
        StoreAction::SetStepInput { name, input } => {
            step_state.step_inputs.insert(name.clone(), input.clone());
        }
        StoreAction::SetStepOutput { name, output } => {
            step_state.step_outputs.insert(name.clone(), output.clone());
        }
        StoreAction::SetStepExecutionStart { name, at } => {
            step_state.step_executions.insert(
                name.clone(),
                StepExecution {
                    start: Some(*at),
                    ..StepExecution::default()
                },
            );
        }
        StoreAction::SetStepExecutionEnd {
            name,
            at,
            success,
            error,
        } => {
            let execution = step_state.step_executions.entry(name.clone()).or_default();
            execution.end = Some(*at);
            execution.success = Some(*success);
            execution.error = error.clone();
        }
        _ => {}
    }
}

fn reduce_sync(sync: &mut SyncState, action: &StoreAction) {
    match action {
        StoreAction::Load(definition) | StoreAction::MarkSaved(definition) | StoreAction::ApplyServerUpdate(definition) => {
            sync.is_dirty = false;
            sync.last_server_version = Some(definition.clone());
            sync.pending_server_update = None;
        }
        StoreAction::QueueServerUpdate(definition) => {
            sync.last_server_version = Some(definition.clone());
            sync.pending_server_update = Some(definition.clone());
        }
        StoreAction::AcceptPendingUpdate => {
            if sync.pending_server_update.take().is_some() {
                sync.is_dirty = false;
            }
        }
        StoreAction::DismissPendingUpdate => sync.pending_server_update = None,
        StoreAction::AddStep(_)
        | StoreAction::UpdateStep { .. }
        | StoreAction::RemoveStep { .. }
        | StoreAction::UpdateWorkflow(_)
        | StoreAction::SetStepInput { .. } => sync.is_dirty = true,
        StoreAction::SetStepOutput { .. } | StoreAction::SetStepExecutionStart { .. } | StoreAction::SetStepExecutionEnd { .. } => {}
    }
}
