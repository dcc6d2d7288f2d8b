use chrono::{DateTime, Utc};
use flowsync_types::{ExecutionError, Step, StepOptions, WorkflowDefinition};
use serde_json::Value;

/// Every mutation the document store understands.
///
/// Actions are plain data: the store validates them, runs the sub-reducers, persists the step
/// maps when they changed, and finally hands the same action to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    /// Mounts a server copy: replaces the workflow, records it as the last server version, clean.
    Load(WorkflowDefinition),
    AddStep(Step),
    UpdateStep {
        name: String,
        update: StepUpdate,
    },
    RemoveStep {
        name: String,
    },
    /// Local wholesale edit of the definition.
    UpdateWorkflow(WorkflowDefinition),
    SetStepInput {
        name: String,
        input: Value,
    },
    SetStepOutput {
        name: String,
        output: Value,
    },
    SetStepExecutionStart {
        name: String,
        at: DateTime<Utc>,
    },
    SetStepExecutionEnd {
        name: String,
        at: DateTime<Utc>,
        success: bool,
        error: Option<ExecutionError>,
    },
    /// The server acknowledged a local save of this definition.
    MarkSaved(WorkflowDefinition),
    /// A server version was accepted while the document was clean.
    ApplyServerUpdate(WorkflowDefinition),
    /// A server version arrived while the document was dirty.
    QueueServerUpdate(WorkflowDefinition),
    AcceptPendingUpdate,
    DismissPendingUpdate,
}

impl StoreAction {
    /// Short tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::AddStep(_) => "add_step",
            Self::UpdateStep { .. } => "update_step",
            Self::RemoveStep { .. } => "remove_step",
            Self::UpdateWorkflow(_) => "update_workflow",
            Self::SetStepInput { .. } => "set_step_input",
            Self::SetStepOutput { .. } => "set_step_output",
            Self::SetStepExecutionStart { .. } => "set_step_execution_start",
            Self::SetStepExecutionEnd { .. } => "set_step_execution_end",
            Self::MarkSaved(_) => "mark_saved",
            Self::ApplyServerUpdate(_) => "apply_server_update",
            Self::QueueServerUpdate(_) => "queue_server_update",
            Self::AcceptPendingUpdate => "accept_pending_update",
            Self::DismissPendingUpdate => "dismiss_pending_update",
        }
    }

    /// Whether the action can change the persisted step maps.
    pub fn touches_step_state(&self) -> bool {
        matches!(
            self,
            Self::RemoveStep { .. }
                | Self::SetStepInput { .. }
                | Self::SetStepOutput { .. }
                | Self::SetStepExecutionStart { .. }
                | Self::SetStepExecutionEnd { .. }
        ) || matches!(self, Self::UpdateStep { update, .. } if update.rename.is_some())
    }

    /// Step named by a step-scoped action.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::AddStep(step) => Some(step.name()),
            Self::UpdateStep { name, .. }
            | Self::RemoveStep { name }
            | Self::SetStepInput { name, .. }
            | Self::SetStepOutput { name, .. }
            | Self::SetStepExecutionStart { name, .. }
            | Self::SetStepExecutionEnd { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Partial update merged into an existing step. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    /// New step name. Renaming discards the step's authored input.
    pub rename: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub execute: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub options: Option<StepOptions>,
}

impl StepUpdate {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            rename: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_execute(mut self, execute: impl Into<String>) -> Self {
        self.execute = Some(execute.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Applies the update to `step`. The rename is applied last so that `input` is cleared.
    pub(crate) fn apply_to(&self, step: &mut Step) {
        let def = &mut step.def;
        if let Some(title) = &self.title {
            def.title = Some(title.clone());
        }
        if let Some(description) = &self.description {
            def.description = Some(description.clone());
        }
        if let Some(schema) = &self.input_schema {
            def.input_schema = Some(schema.clone());
        }
        if let Some(schema) = &self.output_schema {
            def.output_schema = Some(schema.clone());
        }
        if let Some(execute) = &self.execute {
            def.execute = Some(execute.clone());
        }
        if let Some(input) = &self.input {
            step.input = Some(input.clone());
        }
        if let Some(output) = &self.output {
            step.output = Some(output.clone());
        }
        if let Some(options) = &self.options {
            step.options = Some(options.clone());
        }
        if let Some(new_name) = &self.rename
            && new_name != &step.def.name
        {
            step.def.name = new_name.clone();
            step.input = None;
        }
    }
}
