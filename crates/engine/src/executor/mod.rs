//! Step execution: runs a single workflow step through the remote tool-invocation service and
//! records the lifecycle in the document store.
//!
//! - `tool::ToolCaller` abstracts how a tool is invoked
//! - `normalize` maps raw responses onto an output value or a uniform `ExecutionError`
//! - [`StepExecutionOrchestrator`] drives one run: mark start, resolve `@refs`, persist the
//!   authored input, call the tool, store the unwrapped output, mark end
//!
//! Retries are not performed client side; the step's retry policy travels with its definition.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowsync_types::ExecutionError;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::resolve::{RefResolutionError, resolve_at_refs_in_input};
use crate::store::{SharedWorkflowStore, lock_store};

pub mod normalize;
pub mod tool;

pub use normalize::{REFERENCE_RESOLUTION_ERROR, TIMEOUT_ERROR, TOOL_CALL_ERROR, TOOL_EXECUTION_ERROR, normalize_tool_result};
pub use tool::{ToolCallRequest, ToolCallResult, ToolCaller, ToolConnection, ToolContent};

/// Tool invoked for every step unless overridden.
pub const RUN_STEP_TOOL_NAME: &str = "RUN_STEP";

/// Why a step run did not produce an output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepRunError {
    #[error("step '{name}' not found")]
    StepNotFound { name: String },
    #[error("step '{name}' is already running")]
    AlreadyRunning { name: String },
    #[error("failed to resolve {} reference(s)", errors.len())]
    ReferenceResolution { errors: Vec<RefResolutionError> },
    #[error("{0}")]
    Execution(ExecutionError),
}

impl StepRunError {
    /// Uniform `{name, message}` shape, as recorded on the execution.
    pub fn to_execution_error(&self) -> ExecutionError {
        match self {
            Self::StepNotFound { .. } => ExecutionError::new("StepNotFound", self.to_string()),
            Self::AlreadyRunning { .. } => ExecutionError::new("AlreadyRunning", self.to_string()),
            Self::ReferenceResolution { errors } => ExecutionError::new(REFERENCE_RESOLUTION_ERROR, describe_reference_errors(errors)),
            Self::Execution(error) => error.clone(),
        }
    }
}

fn describe_reference_errors(errors: &[RefResolutionError]) -> String {
    errors
        .iter()
        .map(|error| format!("{}: {}", error.reference, error.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of [`StepExecutionOrchestrator::run_step`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRunReport {
    pub step_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reference_errors: Vec<RefResolutionError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Removes the step from the in-flight set when the run ends, including on cancellation.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    step_name: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.step_name);
    }
}

/// What the store hands over before the tool call; the lock is released afterwards.
struct PreparedRun {
    output_key: String,
    arguments: Value,
    timeout: Option<Duration>,
}

pub struct StepExecutionOrchestrator {
    store: SharedWorkflowStore,
    caller: Arc<dyn ToolCaller>,
    connection: ToolConnection,
    locator: Option<String>,
    run_step_tool: String,
    in_flight: Mutex<HashSet<String>>,
}

impl StepExecutionOrchestrator {
    pub fn new(store: SharedWorkflowStore, caller: Arc<dyn ToolCaller>, connection: ToolConnection) -> Self {
        Self {
            store,
            caller,
            connection,
            locator: None,
            run_step_tool: RUN_STEP_TOOL_NAME.to_string(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_run_step_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.run_step_tool = tool_name.into();
        self
    }

    pub fn store(&self) -> &SharedWorkflowStore {
        &self.store
    }

    /// Whether a run of `step_name` is currently in progress.
    pub fn is_running(&self, step_name: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(step_name)
    }

    /// Runs a step and reports the outcome. Never fails; failures are part of the report and of
    /// the step's execution record.
    pub async fn run_step(&self, step_name: &str, input: Option<Value>) -> StepRunReport {
        let started_at = Utc::now();
        let result = self.try_run_step(step_name, input).await;
        let finished_at = Utc::now();

        match result {
            Ok(output) => StepRunReport {
                step_name: step_name.to_string(),
                success: true,
                output: Some(output),
                error: None,
                reference_errors: Vec::new(),
                started_at,
                finished_at,
            },
            Err(error) => StepRunReport {
                step_name: step_name.to_string(),
                success: false,
                output: None,
                error: Some(error.to_execution_error()),
                reference_errors: match error {
                    StepRunError::ReferenceResolution { errors } => errors,
                    _ => Vec::new(),
                },
                started_at,
                finished_at,
            },
        }
    }

    /// Runs a step and returns its unwrapped output.
    ///
    /// `input` overrides the step's stored input; when omitted the edited input is used, then the
    /// authored one, then `{}`.
    ///
    /// # Errors
    ///
    /// - [`StepRunError::StepNotFound`] / [`StepRunError::AlreadyRunning`] leave the execution record untouched
    /// - [`StepRunError::ReferenceResolution`] aborts before the tool is called
    /// - [`StepRunError::Execution`] carries the normalized tool failure
    pub async fn try_run_step(&self, step_name: &str, input: Option<Value>) -> Result<Value, StepRunError> {
        let _guard = self.enter(step_name)?;

        let prepared = self.prepare(step_name, input)?;
        debug!(step = step_name, tool = %self.run_step_tool, timeout = ?prepared.timeout, "calling step tool");

        let request = ToolCallRequest {
            name: self.run_step_tool.clone(),
            arguments: prepared.arguments,
        };
        let call = self.caller.call(&self.connection, request, self.locator.as_deref());
        let response = match prepared.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(response) => Some(response),
                Err(_) => None,
            },
            None => Some(call.await),
        };

        let outcome = match response {
            None => Err(ExecutionError::new(
                TIMEOUT_ERROR,
                format!("Step timed out after {}ms", prepared.timeout.unwrap_or_default().as_millis()),
            )),
            Some(Err(error)) => Err(ExecutionError::new(TOOL_CALL_ERROR, format!("{error:#}"))),
            Some(Ok(result)) => normalize_tool_result(&result),
        };

        self.finish(step_name, &prepared.output_key, &outcome);
        outcome.map_err(StepRunError::Execution)
    }

    fn enter(&self, step_name: &str) -> Result<InFlightGuard<'_>, StepRunError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(step_name.to_string()) {
            debug!(step = step_name, "rejected concurrent run");
            return Err(StepRunError::AlreadyRunning {
                name: step_name.to_string(),
            });
        }
        Ok(InFlightGuard {
            in_flight: &self.in_flight,
            step_name: step_name.to_string(),
        })
    }

    /// Marks the start, resolves references, and persists the authored input under one lock.
    fn prepare(&self, step_name: &str, input: Option<Value>) -> Result<PreparedRun, StepRunError> {
        let mut store = lock_store(&self.store);
        let step = store
            .workflow()
            .step(step_name)
            .cloned()
            .ok_or_else(|| StepRunError::StepNotFound {
                name: step_name.to_string(),
            })?;

        let record = |result: Result<(), crate::store::StoreError>| {
            if let Err(error) = result {
                warn!(step = step_name, error = %error, "failed to record step execution");
            }
        };
        record(store.set_step_execution_start(step_name, Utc::now()));

        let input = input
            .or_else(|| store.state().effective_step_input(step_name).cloned())
            .unwrap_or_else(|| json!({}));
        let state = store.state();
        let resolved = resolve_at_refs_in_input(&input, &state.step_state.step_outputs, state.first_step_input());

        let resolved = match resolved.into_result() {
            Ok(value) => value,
            Err(errors) => {
                warn!(step = step_name, failed = errors.len(), "step input has unresolved references");
                let error = StepRunError::ReferenceResolution { errors };
                record(store.set_step_execution_end(step_name, Utc::now(), false, Some(error.to_execution_error())));
                return Err(error);
            }
        };

        record(store.set_step_input(step_name, input));

        let output_key = if step.def.name.is_empty() { step_name.to_string() } else { step.def.name.clone() };
        Ok(PreparedRun {
            output_key,
            timeout: step.timeout(),
            arguments: json!({"tool": step.def, "input": resolved}),
        })
    }

    fn finish(&self, step_name: &str, output_key: &str, outcome: &Result<Value, ExecutionError>) {
        let mut store = lock_store(&self.store);
        if let Ok(output) = outcome
            && let Err(error) = store.set_step_output(output_key, output.clone())
        {
            warn!(step = step_name, error = %error, "failed to store step output");
        }

        let error = outcome.as_ref().err().cloned();
        match &error {
            Some(error) => debug!(step = step_name, error = %error, "step failed"),
            None => debug!(step = step_name, "step completed"),
        }
        if let Err(store_error) = store.set_step_execution_end(step_name, Utc::now(), error.is_none(), error) {
            warn!(step = step_name, error = %store_error, "failed to record step execution");
        }
    }
}
