//! # Sync Reconciliation
//!
//! Decides what happens when a newer server copy of the workflow arrives:
//!
//! - **Clean**: the server copy replaces the local document immediately.
//! - **Dirty**: the local document is left alone and the server copy is queued as a pending
//!   conflict. The user either accepts it (local edits are discarded) or dismisses it (local
//!   edits are kept and the document stays dirty).
//!
//! There is no partial merge. A best-effort diff names the changed step when exactly one step
//! differs and the step layout is otherwise identical; anything else falls back to a generic
//! message.

use anyhow::Result;
use async_trait::async_trait;
use flowsync_types::WorkflowDefinition;
use tracing::{debug, info};

use crate::store::{SharedWorkflowStore, StoreAction, SyncPhase, WorkflowDocumentStore, lock_store};

/// Reason recorded when a server update is queued instead of applied.
pub const UNSAVED_CHANGES_REASON: &str = "User has unsaved changes";

/// Reads the canonical definition of a workflow from the remote service.
#[async_trait]
pub trait WorkflowReadApi: Send + Sync {
    async fn read(&self, uri: &str) -> Result<WorkflowDefinition>;
}

/// Result of [`SyncReconciler::handle_external_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub applied: bool,
    pub reason: Option<String>,
    /// Name of the single step that differs from the previous server copy, when identifiable.
    pub changed_step: Option<String>,
}

impl ReconcileOutcome {
    fn applied() -> Self {
        Self {
            applied: true,
            reason: None,
            changed_step: None,
        }
    }

    fn queued(changed_step: Option<String>) -> Self {
        Self {
            applied: false,
            reason: Some(UNSAVED_CHANGES_REASON.to_string()),
            changed_step,
        }
    }

    /// Message to show when an update was queued. `None` when it was applied.
    pub fn user_message(&self) -> Option<String> {
        if self.applied {
            return None;
        }
        Some(match &self.changed_step {
            Some(step) => format!("Step \"{step}\" was updated on the server while you have unsaved changes."),
            None => "The workflow was updated on the server while you have unsaved changes.".to_string(),
        })
    }
}

/// Names the only step that differs between two definitions.
///
/// Returns `None` unless both definitions have the same number of steps, the same names at the
/// same positions, and exactly one step that is not deeply equal.
pub fn single_changed_step(previous: &WorkflowDefinition, next: &WorkflowDefinition) -> Option<String> {
    if previous.steps.len() != next.steps.len() {
        return None;
    }
    if previous.steps.iter().zip(&next.steps).any(|(before, after)| before.name() != after.name()) {
        return None;
    }

    let mut changed = previous
        .steps
        .iter()
        .zip(&next.steps)
        .filter(|(before, after)| before != after)
        .map(|(_, after)| after.name());
    match (changed.next(), changed.next()) {
        (Some(name), None) => Some(name.to_string()),
        _ => None,
    }
}

/// Reconciles a server definition against a locked store.
pub fn reconcile(store: &mut WorkflowDocumentStore, server_definition: WorkflowDefinition) -> ReconcileOutcome {
    if !store.sync_state().is_dirty {
        // Sync actions never name a step, so dispatch cannot reject them.
        let _ = store.dispatch(StoreAction::ApplyServerUpdate(server_definition));
        info!(uri = store.uri(), "applied server update");
        return ReconcileOutcome::applied();
    }

    let baseline = store.sync_state().last_server_version.as_ref().unwrap_or(store.workflow());
    let changed_step = single_changed_step(baseline, &server_definition);
    let _ = store.dispatch(StoreAction::QueueServerUpdate(server_definition));
    info!(uri = store.uri(), changed_step = changed_step.as_deref().unwrap_or(""), "queued server update as conflict");
    ReconcileOutcome::queued(changed_step)
}

/// Applies accept/dismiss decisions and external updates to a shared store.
#[derive(Debug, Clone)]
pub struct SyncReconciler {
    store: SharedWorkflowStore,
}

impl SyncReconciler {
    pub fn new(store: SharedWorkflowStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedWorkflowStore {
        &self.store
    }

    pub fn phase(&self) -> SyncPhase {
        lock_store(&self.store).sync_state().phase()
    }

    pub fn handle_external_update(&self, server_definition: WorkflowDefinition) -> ReconcileOutcome {
        reconcile(&mut lock_store(&self.store), server_definition)
    }

    /// Replaces the local document with the pending server copy. Returns `false` when nothing was pending.
    pub fn accept_pending_update(&self) -> bool {
        let mut store = lock_store(&self.store);
        if store.sync_state().pending_server_update.is_none() {
            return false;
        }
        let _ = store.dispatch(StoreAction::AcceptPendingUpdate);
        info!(uri = store.uri(), "accepted pending server update");
        true
    }

    /// Drops the pending server copy and keeps the local edits.
    pub fn dismiss_pending_update(&self) {
        let mut store = lock_store(&self.store);
        let _ = store.dispatch(StoreAction::DismissPendingUpdate);
        debug!(uri = store.uri(), "dismissed pending server update");
    }
}
