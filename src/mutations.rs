//! Create, update and delete against the cached list.
//!
//! The mirror is updated before the request goes out. A create sits in the
//! optimistic queue until the server confirms it; a delete is tombstoned
//! locally and never rolled back, whatever the server answers.

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::RemoteCollection;
use crate::error::{FetchError, SyncError, SyncResult};
use crate::models::{is_temp_id, new_temp_id, CachedRecord};
use crate::reconcile::{MergedView, RecordCache};

/// Shown when a create or update outlives its deadline.
pub const TIMEOUT_MESSAGE: &str = "Request timed out. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
}

/// Short user-facing message for a finished operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: Option<String>,
}

impl Notice {
    fn new(level: NoticeLevel, title: impl Into<String>, description: Option<&str>) -> Self {
        Self {
            level,
            title: title.into(),
            description: description.map(str::to_string),
        }
    }
}

/// How a delete ended. The row is gone from the view in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The row only ever existed locally.
    RemovedPending,
    Confirmed,
    AssumedTimedOut,
    /// The server answered with a failure, transient or not.
    AssumedRejected(String),
    /// No answer came back.
    AssumedNetworkFailure(String),
}

impl DeleteOutcome {
    fn from_fetch(result: Result<(), FetchError>) -> Self {
        match result {
            Ok(()) => DeleteOutcome::Confirmed,
            Err(FetchError::TimedOut(_)) => DeleteOutcome::AssumedTimedOut,
            // Any answer other than ok means the server may not have deleted it.
            Err(FetchError::Rejected(m) | FetchError::Unavailable(m)) => {
                DeleteOutcome::AssumedRejected(m)
            }
            Err(FetchError::Transient(m)) if m.to_lowercase().contains("abort") => {
                DeleteOutcome::AssumedTimedOut
            }
            Err(FetchError::Transient(m)) => DeleteOutcome::AssumedNetworkFailure(m),
        }
    }

    /// Whether the server acknowledged the delete.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DeleteOutcome::Confirmed | DeleteOutcome::RemovedPending)
    }

    /// Notice for the operator. `label` is the record noun, e.g. `"Recovery"`.
    pub fn notice(&self, label: &str) -> Notice {
        match self {
            DeleteOutcome::RemovedPending => Notice::new(
                NoticeLevel::Success,
                "Deleted",
                Some(&format!("Removed pending {}.", label.to_lowercase())),
            ),
            DeleteOutcome::Confirmed => Notice::new(
                NoticeLevel::Success,
                "Deleted",
                Some(&format!("{label} deleted successfully.")),
            ),
            DeleteOutcome::AssumedTimedOut => Notice::new(
                NoticeLevel::Info,
                "Deleted locally",
                Some("Removed from view. Server sync may be delayed."),
            ),
            DeleteOutcome::AssumedRejected(_) => Notice::new(
                NoticeLevel::Warning,
                "Delete may have failed on server",
                Some("Item removed locally. Please refresh to verify."),
            ),
            DeleteOutcome::AssumedNetworkFailure(_) => Notice::new(
                NoticeLevel::Info,
                "Deleted locally",
                Some("Removed from view. Please refresh later to verify server sync."),
            ),
        }
    }
}

/// Map a create/update failure to what the form shows.
fn mutation_error(err: FetchError) -> SyncError {
    match err {
        FetchError::TimedOut(_) => SyncError::Transient(TIMEOUT_MESSAGE.to_string()),
        other => other.into(),
    }
}

impl<R: CachedRecord, C: RemoteCollection> RecordCache<R, C> {
    /// Queue `record` under a fresh temp id and send it.
    ///
    /// On success the queue entry is dropped and the list refetched. A
    /// transient failure leaves the entry queued so it keeps showing until
    /// it expires or the server turns out to have it.
    pub async fn create(&self, mut record: R) -> SyncResult<MergedView<R>> {
        let now = self.now();
        let request_id = Uuid::new_v4().to_string();
        // Suffix keeps two creates in the same millisecond apart.
        let temp_id = format!("{}-{}", new_temp_id(now), &request_id[..8]);
        record.set_record_id(temp_id.clone());
        record.set_client_request_id(request_id.clone());
        let body = record.to_payload();

        {
            let _guard = self.lock_state();
            let mut queue = self.pruned_queue(now);
            queue.push(record);
            self.mirror.save_optimistic(&queue);
        }
        debug!(resource = %self.resource, %temp_id, %request_id, "row queued");

        let result = self
            .remote
            .create(&self.resource, body, &request_id, self.timeouts.mutation)
            .await;

        match result {
            Ok(envelope) => {
                self.forget_queued(&temp_id);
                info!(
                    resource = %self.resource,
                    %temp_id,
                    server_id = envelope.created_id().as_deref().unwrap_or("unknown"),
                    "row created"
                );
                Ok(self.refresh_after_mutation().await)
            }
            Err(e) if e.is_transient() => {
                warn!(resource = %self.resource, %temp_id, error = %e, "create not confirmed, row stays queued");
                Err(mutation_error(e))
            }
            Err(e) => {
                self.forget_queued(&temp_id);
                warn!(resource = %self.resource, %temp_id, error = %e, "create rejected");
                Err(mutation_error(e))
            }
        }
    }

    /// Replace the row `id` on the server, then refetch.
    pub async fn update(&self, id: &str, record: R) -> SyncResult<MergedView<R>> {
        let id = id.trim();
        if is_temp_id(id) {
            return Err(SyncError::Rejected(format!(
                "{} has not been saved to the server yet",
                self.label
            )));
        }

        self.remote
            .update(&self.resource, id, record.to_payload(), self.timeouts.mutation)
            .await
            .map_err(|e| {
                warn!(resource = %self.resource, id, error = %e, "update failed");
                mutation_error(e)
            })?;

        info!(resource = %self.resource, id, "row updated");
        Ok(self.refresh_after_mutation().await)
    }

    /// Hide `id` for good and ask the server to delete it.
    ///
    /// The tombstone, view and queue are updated before the request, so the
    /// row is gone whatever the server answers. Repeating a delete leaves
    /// the local state as it is.
    pub async fn delete(&self, id: &str) -> DeleteOutcome {
        let id = id.trim().to_string();
        let now = self.now();

        {
            let mut state = self.lock_state();

            let mut tombstones = self.pruned_tombstones(now);
            if tombstones.insert(id.clone()) {
                self.mirror.save_tombstones(&tombstones);
            }

            if let Some(rows) = state.last_good.as_mut() {
                rows.retain(|r| r.record_id() != id);
            }

            let queue: Vec<R> = self.mirror.load_optimistic();
            let before = queue.len();
            let queue: Vec<R> = queue.into_iter().filter(|r| r.record_id() != id).collect();
            if queue.len() != before {
                self.mirror.save_optimistic(&queue);
            }
        }

        if is_temp_id(&id) {
            info!(resource = %self.resource, id = %id, "pending row removed locally");
            return DeleteOutcome::RemovedPending;
        }

        let result = self
            .remote
            .delete(&self.resource, &id, self.timeouts.delete)
            .await
            .map(|_| ());
        let outcome = DeleteOutcome::from_fetch(result);

        match &outcome {
            DeleteOutcome::Confirmed => info!(resource = %self.resource, id = %id, "row deleted"),
            other => {
                warn!(resource = %self.resource, id = %id, outcome = ?other, "delete not confirmed, kept hidden locally")
            }
        }
        outcome
    }

    pub fn delete_notice(&self, outcome: &DeleteOutcome) -> Notice {
        outcome.notice(&self.label)
    }

    fn forget_queued(&self, id: &str) {
        let _guard = self.lock_state();
        let queue: Vec<R> = self.mirror.load_optimistic();
        let before = queue.len();
        let queue: Vec<R> = queue.into_iter().filter(|r| r.record_id() != id).collect();
        if queue.len() != before {
            self.mirror.save_optimistic(&queue);
        }
    }

    /// Refetch after a write. If that fails the current rows are returned,
    /// marked stale; the write itself already succeeded.
    async fn refresh_after_mutation(&self) -> MergedView<R> {
        match self.refresh().await {
            Ok(view) => view,
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "refetch after write failed");
                let mut view = self.current_view();
                view.stale = true;
                view
            }
        }
    }
}
