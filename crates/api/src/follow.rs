//! Live follow loop: remote changes in, reconciliation decisions out.
//!
//! The watch connection pushes forwarded events into an unbounded queue; a single consumer
//! drains it in arrival order, re-reads the workflow for every add or modify event, and hands
//! the server copy to the reconciler. Reads never overlap, so decisions are applied in the
//! order the changes happened.

use flowsync_engine::{ReconcileOutcome, SyncReconciler, WorkflowReadApi};
use flowsync_types::{WatchEvent, WatchEventKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::watch::{ResourceWatchClient, RetryConfig, WatchError, WatchOptions};

/// Counters reported when a follow loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowSummary {
    pub events: usize,
    pub applied: usize,
    pub queued: usize,
    pub read_failures: usize,
}

/// Follows `uri` until `cancel` fires or the watch gives up.
///
/// Historical events are always skipped. `on_outcome` sees every reconciliation decision.
pub async fn follow_workflow<F>(
    watch: &ResourceWatchClient,
    reader: &dyn WorkflowReadApi,
    reconciler: &SyncReconciler,
    uri: &str,
    path_filter: &str,
    cancel: &CancellationToken,
    on_outcome: F,
) -> Result<FollowSummary, WatchError>
where
    F: FnMut(&WatchEvent, &ReconcileOutcome),
{
    let options = WatchOptions::new(path_filter);
    let (sender, receiver) = mpsc::unbounded_channel();

    // The sender lives in the callback; dropping it when the watch ends closes the queue.
    let producer = async move {
        watch
            .watch_with_retry(&options, RetryConfig::default(), cancel, move |event| {
                if sender.send(event).is_err() {
                    warn!("follow queue closed; dropping watch event");
                }
            })
            .await
    };
    let consumer = reconcile_events(receiver, reader, reconciler, uri, path_filter, on_outcome);

    let (watch_result, summary) = tokio::join!(producer, consumer);
    watch_result.map(|()| summary)
}

/// Drains queued events, reconciling each add or modify that matches `path_filter`.
pub async fn reconcile_events<F>(
    mut receiver: mpsc::UnboundedReceiver<WatchEvent>,
    reader: &dyn WorkflowReadApi,
    reconciler: &SyncReconciler,
    uri: &str,
    path_filter: &str,
    mut on_outcome: F,
) -> FollowSummary
where
    F: FnMut(&WatchEvent, &ReconcileOutcome),
{
    let mut summary = FollowSummary::default();
    while let Some(event) = receiver.recv().await {
        if !event.path.starts_with(path_filter) {
            continue;
        }
        summary.events += 1;

        if event.kind == WatchEventKind::Delete {
            info!(path = %event.path, "workflow deleted remotely");
            continue;
        }

        match reader.read(uri).await {
            Ok(server_definition) => {
                let outcome = reconciler.handle_external_update(server_definition);
                if outcome.applied {
                    summary.applied += 1;
                } else {
                    summary.queued += 1;
                }
                on_outcome(&event, &outcome);
            }
            Err(error) => {
                summary.read_failures += 1;
                warn!(uri, path = %event.path, error = %format!("{error:#}"), "failed to read workflow after remote change");
            }
        }
    }
    summary
}
