//! # Workflow Document Store
//!
//! Holds the canonical local copy of a [`WorkflowDefinition`], the per-step maps recorded while
//! authoring and running steps, and the sync bookkeeping used by the reconciler.
//!
//! All mutations go through [`WorkflowDocumentStore::dispatch`] as a [`StoreAction`]. The action
//! is validated, folded into the state by three sub-reducers (definition, step state, sync), the
//! step maps are written through the configured [`StepStateStore`] when they changed, and every
//! subscriber is notified synchronously in subscription order. The definition itself is never
//! written locally; it is always re-read from the server.
//!
//! ```rust
//! use flowsync_engine::store::WorkflowDocumentStore;
//! use flowsync_types::{Step, WorkflowDefinition};
//! use serde_json::json;
//!
//! let mut store = WorkflowDocumentStore::in_memory("rsc://demo", WorkflowDefinition::new("demo"));
//! store.add_step(Step::named("fetch")).unwrap();
//! store.set_step_input("fetch", json!({"id": 1})).unwrap();
//! assert!(store.sync_state().is_dirty);
//! ```

pub mod actions;
mod reducers;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use flowsync_types::{ExecutionError, PersistedStepState, Step, WorkflowDefinition};
use flowsync_util::{InMemoryStepStateStore, StepStateStore};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub use actions::{StepUpdate, StoreAction};

/// Rejected store mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("step '{name}' already exists")]
    DuplicateStep { name: String },
    #[error("step '{name}' not found")]
    StepNotFound { name: String },
    #[error("step name cannot be empty")]
    EmptyStepName,
}

/// Relationship between the local document and the server copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    /// Local edits have not been acknowledged by the server.
    pub is_dirty: bool,
    /// Most recent definition observed from the server.
    pub last_server_version: Option<WorkflowDefinition>,
    /// Server definition waiting for the user to accept or dismiss it. Only set while dirty.
    pub pending_server_update: Option<WorkflowDefinition>,
}

impl SyncState {
    pub fn phase(&self) -> SyncPhase {
        if self.pending_server_update.is_some() {
            SyncPhase::PendingConflict
        } else if self.is_dirty {
            SyncPhase::Dirty
        } else {
            SyncPhase::Clean
        }
    }
}

/// Derived sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Clean,
    Dirty,
    PendingConflict,
}

/// Complete store snapshot handed to subscribers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    pub workflow: WorkflowDefinition,
    pub step_state: PersistedStepState,
    pub sync: SyncState,
}

impl StoreState {
    /// The workflow input: the first step's edited input, falling back to its authored input.
    pub fn first_step_input(&self) -> Option<&Value> {
        let first = self.workflow.first_step()?;
        self.step_state.step_inputs.get(first.name()).or(first.input.as_ref())
    }

    /// Input to run a step with when the caller does not supply one.
    pub fn effective_step_input(&self, step_name: &str) -> Option<&Value> {
        self.step_state
            .step_inputs
            .get(step_name)
            .or_else(|| self.workflow.step(step_name).and_then(|step| step.input.as_ref()))
    }
}

/// Handle returned by [`WorkflowDocumentStore::subscribe`].
pub type SubscriptionId = u64;

type Subscriber = Box<dyn FnMut(&StoreState, &StoreAction) + Send>;

/// Store handle shared between async tasks. The lock is never held across an await.
pub type SharedWorkflowStore = Arc<Mutex<WorkflowDocumentStore>>;

/// Locks a shared store, recovering the guard if a previous holder panicked.
pub fn lock_store(store: &SharedWorkflowStore) -> MutexGuard<'_, WorkflowDocumentStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WorkflowDocumentStore {
    uri: String,
    state: StoreState,
    persistence: Arc<dyn StepStateStore>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription_id: SubscriptionId,
    last_persist_error: Option<String>,
}

impl std::fmt::Debug for WorkflowDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDocumentStore")
            .field("uri", &self.uri)
            .field("state", &self.state)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl WorkflowDocumentStore {
    /// Mounts `workflow` as the server copy and restores the cached step maps for `uri`.
    ///
    /// A cache that cannot be read is logged and treated as empty.
    pub fn new(uri: impl Into<String>, workflow: WorkflowDefinition, persistence: Arc<dyn StepStateStore>) -> Self {
        let uri = uri.into();
        let mut last_persist_error = None;
        let step_state = match persistence.load(&uri) {
            Ok(cached) => cached.unwrap_or_default(),
            Err(error) => {
                warn!(uri = %uri, error = %error, "failed to load cached step state");
                last_persist_error = Some(error.to_string());
                PersistedStepState::default()
            }
        };
        debug!(uri = %uri, steps = workflow.steps.len(), cached_outputs = step_state.step_outputs.len(), "mounted workflow");

        Self {
            uri,
            state: StoreState {
                sync: SyncState {
                    last_server_version: Some(workflow.clone()),
                    ..SyncState::default()
                },
                workflow,
                step_state,
            },
            persistence,
            subscribers: Vec::new(),
            next_subscription_id: 0,
            last_persist_error,
        }
    }

    /// Store backed by a throwaway in-memory cache.
    pub fn in_memory(uri: impl Into<String>, workflow: WorkflowDefinition) -> Self {
        Self::new(uri, workflow, Arc::new(InMemoryStepStateStore::new()))
    }

    pub fn into_shared(self) -> SharedWorkflowStore {
        Arc::new(Mutex::new(self))
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.state.workflow
    }

    pub fn step_state(&self) -> &PersistedStepState {
        &self.state.step_state
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.state.sync
    }

    /// Message of the most recent failed cache write, cleared by the next successful one.
    pub fn last_persist_error(&self) -> Option<&str> {
        self.last_persist_error.as_deref()
    }

    /// Applies an action, persists the step maps when needed, and notifies subscribers.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the action names an unknown step or would duplicate one.
    /// Rejected actions leave the state untouched and are not broadcast.
    pub fn dispatch(&mut self, action: StoreAction) -> Result<(), StoreError> {
        reducers::reduce(&mut self.state, &action)?;
        debug!(action = action.kind(), step = action.step_name().unwrap_or(""), dirty = self.state.sync.is_dirty, "store action applied");

        if action.touches_step_state() {
            self.persist_step_state();
        }

        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber(&self.state, &action);
        }
        Ok(())
    }

    fn persist_step_state(&mut self) {
        match self.persistence.save(&self.uri, &self.state.step_state) {
            Ok(()) => self.last_persist_error = None,
            Err(error) => {
                warn!(uri = %self.uri, error = %error, "failed to persist step state");
                self.last_persist_error = Some(error.to_string());
            }
        }
    }

    /// Registers a callback invoked after every successful dispatch.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&StoreState, &StoreAction) + Send + 'static,
    {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Removes a subscription. Returns `false` when the id is unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(subscription_id, _)| *subscription_id != id);
        self.subscribers.len() != before
    }

    pub fn load(&mut self, workflow: WorkflowDefinition) -> Result<(), StoreError> {
        self.dispatch(StoreAction::Load(workflow))
    }

    pub fn add_step(&mut self, step: Step) -> Result<(), StoreError> {
        self.dispatch(StoreAction::AddStep(step))
    }

    pub fn update_step(&mut self, name: &str, update: StepUpdate) -> Result<(), StoreError> {
        self.dispatch(StoreAction::UpdateStep {
            name: name.to_string(),
            update,
        })
    }

    pub fn remove_step(&mut self, name: &str) -> Result<(), StoreError> {
        self.dispatch(StoreAction::RemoveStep { name: name.to_string() })
    }

    pub fn update_workflow(&mut self, workflow: WorkflowDefinition) -> Result<(), StoreError> {
        self.dispatch(StoreAction::UpdateWorkflow(workflow))
    }

    pub fn set_step_input(&mut self, name: &str, input: Value) -> Result<(), StoreError> {
        self.dispatch(StoreAction::SetStepInput {
            name: name.to_string(),
            input,
        })
    }

    pub fn set_step_output(&mut self, name: &str, output: Value) -> Result<(), StoreError> {
        self.dispatch(StoreAction::SetStepOutput {
            name: name.to_string(),
            output,
        })
    }

    pub fn set_step_execution_start(&mut self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.dispatch(StoreAction::SetStepExecutionStart {
            name: name.to_string(),
            at,
        })
    }

    pub fn set_step_execution_end(
        &mut self,
        name: &str,
        at: DateTime<Utc>,
        success: bool,
        error: Option<ExecutionError>,
    ) -> Result<(), StoreError> {
        self.dispatch(StoreAction::SetStepExecutionEnd {
            name: name.to_string(),
            at,
            success,
            error,
        })
    }

    pub fn mark_saved(&mut self, workflow: WorkflowDefinition) -> Result<(), StoreError> {
        self.dispatch(StoreAction::MarkSaved(workflow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_types::ExecutionStatus;
    use flowsync_util::StepStateStoreError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const URI: &str = "rsc://workspace/workflows/onboarding.json";

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "onboarding".into(),
            description: String::new(),
            steps: vec![
                Step::named("fetch").with_input(json!({"email": "ada@example.com"})),
                Step::named("notify").with_input(json!({"to": "@fetch.email"})),
            ],
        }
    }

    struct FailingStore;

    impl StepStateStore for FailingStore {
        fn load(&self, _: &str) -> Result<Option<PersistedStepState>, StepStateStoreError> {
            Ok(None)
        }

        fn save(&self, _: &str, _: &PersistedStepState) -> Result<(), StepStateStoreError> {
            Err(StepStateStoreError::Io(std::io::Error::other("disk full")))
        }

        fn remove(&self, _: &str) -> Result<(), StepStateStoreError> {
            Ok(())
        }
    }

    #[test]
    fn mounted_workflow_is_clean() {
        let store = WorkflowDocumentStore::in_memory(URI, workflow());
        assert_eq!(store.sync_state().phase(), SyncPhase::Clean);
        assert_eq!(store.sync_state().last_server_version.as_ref(), Some(&workflow()));
    }

    #[test]
    fn definition_edits_mark_dirty_but_bookkeeping_does_not() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        store.set_step_output("fetch", json!({"id": 1})).unwrap();
        store.set_step_execution_start("fetch", Utc::now()).unwrap();
        assert!(!store.sync_state().is_dirty);

        store.set_step_input("fetch", json!({"email": "grace@example.com"})).unwrap();
        assert!(store.sync_state().is_dirty);
        assert_eq!(store.sync_state().phase(), SyncPhase::Dirty);
    }

    #[test]
    fn rejects_duplicate_and_unknown_steps() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        assert_eq!(
            store.add_step(Step::named("fetch")),
            Err(StoreError::DuplicateStep { name: "fetch".into() })
        );
        assert_eq!(
            store.remove_step("ghost"),
            Err(StoreError::StepNotFound { name: "ghost".into() })
        );
        assert_eq!(
            store.update_step("fetch", StepUpdate::rename("notify")),
            Err(StoreError::DuplicateStep { name: "notify".into() })
        );
        assert!(!store.sync_state().is_dirty);
    }

    #[test]
    fn update_step_merges_and_preserves_name() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        store
            .update_step("fetch", StepUpdate::default().with_execute("export default () => 1").with_title("Fetch"))
            .unwrap();
        let step = store.workflow().step("fetch").expect("step kept its name");
        assert_eq!(step.def.execute.as_deref(), Some("export default () => 1"));
        assert_eq!(step.def.title.as_deref(), Some("Fetch"));
        assert!(step.input.is_some());
    }

    #[test]
    fn rename_discards_input_and_cached_input() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        store.set_step_input("notify", json!({"to": "x"})).unwrap();
        store.update_step("notify", StepUpdate::rename("announce")).unwrap();

        let renamed = store.workflow().step("announce").expect("renamed step");
        assert!(renamed.input.is_none());
        assert!(store.workflow().step("notify").is_none());
        assert!(!store.step_state().step_inputs.contains_key("notify"));
    }

    #[test]
    fn rename_moves_outputs_and_executions_to_the_new_name() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        store.set_step_output("notify", json!({"sent": true})).unwrap();
        store.set_step_execution_start("notify", Utc::now()).unwrap();
        store.set_step_execution_end("notify", Utc::now(), true, None).unwrap();

        store.update_step("notify", StepUpdate::rename("announce")).unwrap();

        let step_state = store.step_state();
        assert!(!step_state.step_outputs.contains_key("notify"));
        assert!(!step_state.step_executions.contains_key("notify"));
        assert_eq!(step_state.step_outputs.get("announce"), Some(&json!({"sent": true})));
        assert_eq!(
            step_state.step_executions.get("announce").map(|execution| execution.status()),
            Some(ExecutionStatus::Completed)
        );
    }

    #[test]
    fn remove_step_drops_cached_maps() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        store.set_step_output("notify", json!("sent")).unwrap();
        store.remove_step("notify").unwrap();
        assert_eq!(store.workflow().step_names(), vec!["fetch"]);
        assert!(store.step_state().step_outputs.is_empty());
    }

    #[test]
    fn execution_records_follow_lifecycle() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        store.set_step_execution_start("fetch", Utc::now()).unwrap();
        assert_eq!(store.step_state().step_executions["fetch"].status(), ExecutionStatus::Running);

        let error = ExecutionError::new("ToolCallError", "offline");
        store.set_step_execution_end("fetch", Utc::now(), false, Some(error.clone())).unwrap();
        let execution = &store.step_state().step_executions["fetch"];
        assert_eq!(execution.status(), ExecutionStatus::Failed);
        assert_eq!(execution.error.as_ref(), Some(&error));

        store.set_step_execution_start("fetch", Utc::now()).unwrap();
        let restarted = &store.step_state().step_executions["fetch"];
        assert!(restarted.end.is_none() && restarted.error.is_none() && restarted.success.is_none());
    }

    #[test]
    fn step_maps_survive_remount() {
        let cache: Arc<dyn StepStateStore> = Arc::new(InMemoryStepStateStore::new());
        let mut store = WorkflowDocumentStore::new(URI, workflow(), cache.clone());
        store.set_step_output("fetch", json!({"id": 9})).unwrap();
        drop(store);

        let remounted = WorkflowDocumentStore::new(URI, workflow(), cache);
        assert_eq!(remounted.step_state().step_outputs["fetch"], json!({"id": 9}));
        assert_eq!(remounted.workflow(), &workflow());
    }

    #[test]
    fn persistence_failures_keep_memory_state() {
        let mut store = WorkflowDocumentStore::new(URI, workflow(), Arc::new(FailingStore));
        store.set_step_output("fetch", json!({"id": 1})).unwrap();
        assert_eq!(store.step_state().step_outputs["fetch"], json!({"id": 1}));
        assert!(store.last_persist_error().is_some_and(|message| message.contains("disk full")));
    }

    #[test]
    fn subscribers_run_in_order_until_unsubscribed() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first_seen = seen.clone();
        let first = store.subscribe(move |_, action| first_seen.lock().unwrap().push(format!("first:{}", action.kind())));
        let second_seen = seen.clone();
        store.subscribe(move |state, _| second_seen.lock().unwrap().push(format!("second:{}", state.sync.is_dirty)));

        store.add_step(Step::named("audit")).unwrap();
        assert!(store.unsubscribe(first));
        store.remove_step("audit").unwrap();
        let _ = store.remove_step("audit");

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:add_step", "second:true", "second:true"]
        );
    }

    #[test]
    fn mark_saved_clears_dirty_flag() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        store.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.add_step(Step::named("audit")).unwrap();
        let saved = store.workflow().clone();
        store.mark_saved(saved.clone()).unwrap();
        assert_eq!(store.sync_state().phase(), SyncPhase::Clean);
        assert_eq!(store.sync_state().last_server_version.as_ref(), Some(&saved));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn first_step_input_prefers_edited_value() {
        let mut store = WorkflowDocumentStore::in_memory(URI, workflow());
        assert_eq!(store.state().first_step_input(), Some(&json!({"email": "ada@example.com"})));
        store.set_step_input("fetch", json!({"email": "grace@example.com"})).unwrap();
        assert_eq!(store.state().first_step_input(), Some(&json!({"email": "grace@example.com"})));
    }
}
