//! Shared type definitions for the flowsync workspace.
//!
//! Everything that crosses a crate boundary lives here: the workflow document and its steps,
//! per-step execution records, the locally cached step state, reference candidates surfaced to
//! editors, and the change events emitted by the watch endpoint.

pub mod execution;
pub mod references;
pub mod watch;
pub mod workflow;

pub use execution::{ExecutionError, ExecutionStatus, PersistedStepState, StepExecution, StepExecutions, StepInputs, StepOutputs};
pub use references::{AtRefKind, AtRefOption};
pub use watch::{WatchEvent, WatchEventKind};
pub use workflow::{Backoff, RetryPolicy, Step, StepDefinition, StepOptions, WorkflowDefinition};
