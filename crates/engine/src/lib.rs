//! # Flowsync Engine
//!
//! The synchronization and execution core behind the workflow editor. The canonical workflow
//! lives on a remote service; this crate keeps an optimistically edited local replica that can
//! always be reconciled with the server copy, resolves `@ref` links between step inputs and
//! prior outputs, and runs individual steps through a remote tool-invocation service.
//!
//! ## Usage
//!
//! ```rust
//! use flowsync_engine::{SyncReconciler, WorkflowDocumentStore, catalog::available_references_for};
//! use flowsync_types::{Step, WorkflowDefinition};
//! use serde_json::json;
//!
//! let mut workflow = WorkflowDefinition::new("onboarding");
//! workflow.steps.push(Step::named("fetch").with_input(json!({"email": "ada@example.com"})));
//! workflow.steps.push(Step::named("notify"));
//!
//! let mut store = WorkflowDocumentStore::in_memory("rsc://onboarding", workflow.clone());
//! store.set_step_output("fetch", json!({"id": 7})).unwrap();
//! let references = available_references_for(store.state(), "notify");
//! assert!(references.iter().any(|option| option.value == "@fetch.id"));
//!
//! let reconciler = SyncReconciler::new(store.into_shared());
//! assert!(reconciler.handle_external_update(workflow).applied);
//! ```
//!
//! ## Architecture
//!
//! - **`resolve`**: `@ref` resolution against step outputs and the workflow input
//! - **`catalog`**: reference candidates per step, schema inference and compatibility
//! - **`store`**: the document store, its actions, reducers, and subscriptions
//! - **`sync`**: server update reconciliation and the workflow read seam
//! - **`executor`**: single-step runs through a `ToolCaller`
//! - **`debounce`**: keyed debouncing for rapid field edits

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use flowsync_types::WorkflowDefinition;

pub mod catalog;
pub mod debounce;
pub mod executor;
pub mod resolve;
pub mod store;
pub mod sync;

pub use catalog::{available_references_for, build_available_references, compatible_options, infer_schema, is_schema_compatible};
pub use debounce::Debouncer;
pub use executor::{
    RUN_STEP_TOOL_NAME, StepExecutionOrchestrator, StepRunError, StepRunReport, ToolCallRequest, ToolCallResult, ToolCaller,
    ToolConnection, ToolContent,
};
pub use resolve::{RefResolutionError, ReferenceError, ResolvedInput, resolve_at_ref, resolve_at_refs_in_input};
pub use store::{
    SharedWorkflowStore, StepUpdate, StoreAction, StoreError, StoreState, SyncPhase, SyncState, WorkflowDocumentStore, lock_store,
};
pub use sync::{ReconcileOutcome, SyncReconciler, WorkflowReadApi};

/// Loads a workflow definition from a YAML or JSON file.
///
/// # Errors
///
/// Fails when the file cannot be read or does not describe a workflow definition.
///
/// # Examples
///
/// ```rust
/// use flowsync_engine::load_workflow_file;
///
/// let temp_dir = tempfile::tempdir()?;
/// let workflow_path = temp_dir.path().join("onboarding.yaml");
/// std::fs::write(&workflow_path, "name: onboarding\nsteps:\n  - def:\n      name: fetch\n")?;
///
/// let workflow = load_workflow_file(&workflow_path)?;
/// assert_eq!(workflow.step_names(), vec!["fetch"]);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn load_workflow_file(file_path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let file_path = file_path.as_ref();
    let content =
        fs::read_to_string(file_path).with_context(|| format!("Failed to read workflow file: {}", file_path.display()))?;

    let is_json = file_path.extension().and_then(|extension| extension.to_str()) == Some("json");
    let workflow: WorkflowDefinition = if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON workflow: {}", file_path.display()))?
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML workflow: {}", file_path.display()))?
    };

    if workflow.name.trim().is_empty() {
        anyhow::bail!("Workflow file {} has no name", file_path.display());
    }
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_json_and_yaml_workflows() {
        let temp_dir = tempfile::tempdir().unwrap();

        let json_path = temp_dir.path().join("billing.json");
        fs::write(&json_path, r#"{"name": "billing", "steps": [{"def": {"name": "charge"}, "input": {"amount": 5}}]}"#).unwrap();
        let workflow = load_workflow_file(&json_path).unwrap();
        assert_eq!(workflow.step("charge").and_then(|step| step.input.clone()), Some(serde_json::json!({"amount": 5})));

        let yaml_path = temp_dir.path().join("billing.yaml");
        fs::write(&yaml_path, "name: billing\ndescription: Charges\nsteps: []\n").unwrap();
        assert_eq!(load_workflow_file(&yaml_path).unwrap().description, "Charges");
    }

    #[test]
    fn rejects_unnamed_workflows() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("anonymous.yaml");
        fs::write(&path, "name: ''\nsteps: []\n").unwrap();
        let error = load_workflow_file(&path).unwrap_err();
        assert!(error.to_string().contains("has no name"));
    }
}
