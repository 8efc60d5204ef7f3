//! The recovery list: form drafts in, cached rows out.
//!
//! Wraps the generic cache with what the recovery page needs on top: the
//! counterparty and employee pickers, and the id → organisation name map
//! that keeps a new row labelled when the customer list was slow to load.

use std::sync::Arc;

use chrono::Local;
use serde_json::Value;
use tracing::debug;

use crate::api::{fetch_lookup_rows, RemoteCollection};
use crate::config::Config;
use crate::error::SyncResult;
use crate::models::{Recovery, RecoveryDraft};
use crate::reconcile::{MergedView, RecordCache, Timeouts};
use crate::storage::{LocalMirror, MirrorStore};

pub const RECOVERIES: &str = "recoveries";
pub const CREDIT_CUSTOMERS: &str = "credit-customers";
pub const EMPLOYEES: &str = "employees";

pub type RecoveryCache<C> = RecordCache<Recovery, C>;

/// Recovery cache over `remote`, mirrored into `store`.
pub fn recovery_cache<C: RemoteCollection>(
    remote: C,
    store: Arc<dyn MirrorStore>,
    config: &Config,
) -> RecoveryCache<C> {
    RecordCache::new(RECOVERIES, remote, LocalMirror::new(store, RECOVERIES))
        .with_label("Recovery")
        .with_timeouts(Timeouts::from_config(config))
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl<C: RemoteCollection> RecordCache<Recovery, C> {
    /// Credit customers for the picker. Each organisation name seen is
    /// remembered for later drafts.
    pub async fn load_counterparties(&self) -> SyncResult<Vec<Value>> {
        let rows = fetch_lookup_rows(&self.remote, CREDIT_CUSTOMERS, self.timeouts.list).await?;
        for row in &rows {
            let (Some(id), Some(name)) = (
                row_id(row),
                row.get("organization_name").and_then(Value::as_str),
            ) else {
                continue;
            };
            self.mirror.remember_display_name(&id, name);
        }
        debug!(count = rows.len(), "counterparties loaded");
        Ok(rows)
    }

    pub async fn load_employees(&self) -> SyncResult<Vec<Value>> {
        let rows = fetch_lookup_rows(&self.remote, EMPLOYEES, self.timeouts.list).await?;
        debug!(count = rows.len(), "employees loaded");
        Ok(rows)
    }

    fn draft_to_row(&self, draft: RecoveryDraft, existing: Option<&Recovery>) -> Recovery {
        let today = self.now().with_timezone(&Local).date_naive();
        let row = draft.into_recovery(&self.mirror.display_names(), existing, today);
        if let (Some(id), Some(name)) = (row.credit_customer_id.as_deref(), row.organization_name.as_deref()) {
            self.mirror.remember_display_name(id, name);
        }
        row
    }

    pub async fn create_from_draft(&self, draft: RecoveryDraft) -> SyncResult<MergedView<Recovery>> {
        let row = self.draft_to_row(draft, None);
        self.create(row).await
    }

    /// Update `id` from the edit form. The row's current organisation name
    /// is kept.
    pub async fn update_from_draft(
        &self,
        id: &str,
        draft: RecoveryDraft,
    ) -> SyncResult<MergedView<Recovery>> {
        let existing = self
            .current_view()
            .rows
            .into_iter()
            .find(|r| r.id == id.trim());
        let row = self.draft_to_row(draft, existing.as_ref());
        self.update(id, row).await
    }
}
