//! Read-through cache for one list resource.
//!
//! A refresh fetches the authoritative list and merges it with the local
//! mirror: tombstoned ids are hidden, optimistic rows the server now has are
//! dropped from the queue, and the rest are appended after the server rows.
//! When the fetch fails transiently the last good view (or the optimistic
//! queue) is served instead, marked stale. A transient failure never turns a
//! populated view into an empty one.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::api::RemoteCollection;
use crate::config::Config;
use crate::error::SyncResult;
use crate::models::CachedRecord;
use crate::storage::{LocalMirror, OPTIMISTIC_MAX_AGE_MS, TOMBSTONE_MAX_AGE_MS};

/// Server rows kept per refresh. Anything past this is not shown.
pub const MAX_LIST_ROWS: usize = 50;

/// A view older than this is flagged stale.
const STALE_AFTER_MS: i64 = 60_000;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Where the rows of a [`MergedView`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewSource {
    Server,
    /// Last good merged view, kept in memory.
    MemoryCache,
    /// The persisted optimistic queue.
    LocalQueue,
    Empty,
}

/// The rows a list page renders for one read cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MergedView<R> {
    pub rows: Vec<R>,
    pub source: ViewSource,
    pub stale: bool,
    /// Time of the last successful server read behind these rows.
    pub loaded_at: Option<DateTime<Utc>>,
}

impl<R> MergedView<R> {
    fn fallback(rows: Vec<R>, source: ViewSource, loaded_at: Option<DateTime<Utc>>) -> Self {
        Self {
            rows,
            source,
            stale: true,
            loaded_at,
        }
    }
}

/// Result of merging one server response with the optimistic queue.
#[derive(Debug, Clone)]
pub struct MergeOutcome<R> {
    /// Server rows first, still-pending rows after.
    pub rows: Vec<R>,
    /// The queue as it should be persisted.
    pub still_pending: Vec<R>,
    /// Queue entries the server now has.
    pub confirmed: usize,
}

/// Merge server rows with the optimistic queue.
///
/// Tombstoned ids are removed from both sides. A queued row is confirmed
/// when the server returns its id, its client request id, or its
/// fingerprint.
pub fn merge_server_rows<R: CachedRecord>(
    server_rows: Vec<R>,
    tombstones: &BTreeSet<String>,
    queue: Vec<R>,
) -> MergeOutcome<R> {
    let server_rows: Vec<R> = server_rows
        .into_iter()
        .filter(|r| !tombstones.contains(r.record_id()))
        .collect();

    let server_ids: HashSet<&str> = server_rows.iter().map(|r| r.record_id()).collect();
    let server_request_ids: HashSet<&str> =
        server_rows.iter().filter_map(|r| r.client_request_id()).collect();
    let server_fingerprints: HashSet<String> = server_rows.iter().map(|r| r.fingerprint()).collect();

    let mut confirmed = 0;
    let still_pending: Vec<R> = queue
        .into_iter()
        .filter(|r| !tombstones.contains(r.record_id()))
        .filter(|r| {
            let is_confirmed = server_ids.contains(r.record_id())
                || r.client_request_id().is_some_and(|c| server_request_ids.contains(c))
                || server_fingerprints.contains(&r.fingerprint());
            if is_confirmed {
                confirmed += 1;
            }
            !is_confirmed
        })
        .collect();

    let mut rows = server_rows;
    rows.extend(still_pending.iter().cloned());

    MergeOutcome {
        rows,
        still_pending,
        confirmed,
    }
}

/// Decode the first `limit` raw rows. Rows that do not parse are skipped.
pub fn decode_rows<R: CachedRecord>(raw: Vec<Value>, limit: usize) -> Vec<R> {
    raw.into_iter()
        .take(limit)
        .filter_map(|v| match serde_json::from_value::<R>(v) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "skipping malformed server row");
                None
            }
        })
        .collect()
}

/// Request deadlines used by the cache.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub list: Duration,
    pub mutation: Duration,
    pub delete: Duration,
}

impl Timeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            list: config.list_timeout,
            mutation: config.mutation_timeout,
            delete: config.delete_timeout,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug)]
pub(crate) struct ViewState<R> {
    pub(crate) last_good: Option<Vec<R>>,
    pub(crate) loaded_at: Option<DateTime<Utc>>,
    pub(crate) source: Option<ViewSource>,
}

impl<R> Default for ViewState<R> {
    fn default() -> Self {
        Self {
            last_good: None,
            loaded_at: None,
            source: None,
        }
    }
}

/// Cache service for one list resource: the reconciler plus the mutator
/// (see `mutations`), over an injected remote and mirror.
///
/// Each read-modify-write of the mirror happens under `state`'s lock with
/// no await in between. Overlapping refreshes are not coalesced; the one
/// that resolves last defines the view.
pub struct RecordCache<R: CachedRecord, C: RemoteCollection> {
    pub(crate) resource: String,
    pub(crate) label: String,
    pub(crate) remote: C,
    pub(crate) mirror: LocalMirror,
    pub(crate) timeouts: Timeouts,
    pub(crate) state: Mutex<ViewState<R>>,
    clock: Clock,
}

impl<R: CachedRecord, C: RemoteCollection> RecordCache<R, C> {
    pub fn new(resource: &str, remote: C, mirror: LocalMirror) -> Self {
        Self {
            resource: resource.trim_matches('/').to_string(),
            label: "Record".to_string(),
            remote,
            mirror,
            timeouts: Timeouts::default(),
            state: Mutex::new(ViewState::default()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Noun used in user notices, e.g. `"Recovery"`.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn remote(&self) -> &C {
        &self.remote
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ViewState<R>> {
        // A panic elsewhere must not take the list down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load the queue, drop expired temp rows, persist if anything changed.
    pub(crate) fn pruned_queue(&self, now: DateTime<Utc>) -> Vec<R> {
        let queue: Vec<R> = self.mirror.load_optimistic();
        let before = queue.len();
        let queue = self.mirror.prune_optimistic(
            queue,
            ChronoDuration::milliseconds(OPTIMISTIC_MAX_AGE_MS),
            now,
        );
        if queue.len() != before {
            debug!(resource = %self.resource, pruned = before - queue.len(), "expired optimistic rows dropped");
            self.mirror.save_optimistic(&queue);
        }
        queue
    }

    /// Load the tombstones, forget expired temp ids, persist if changed.
    pub(crate) fn pruned_tombstones(&self, now: DateTime<Utc>) -> BTreeSet<String> {
        let tombstones = self.mirror.load_tombstones();
        let before = tombstones.len();
        let tombstones = self.mirror.prune_tombstones(
            tombstones,
            ChronoDuration::milliseconds(TOMBSTONE_MAX_AGE_MS),
            now,
        );
        if tombstones.len() != before {
            self.mirror.save_tombstones(&tombstones);
        }
        tombstones
    }

    /// What to show before the first response: the pruned optimistic queue
    /// minus tombstones.
    pub fn initial_view(&self) -> MergedView<R> {
        let now = self.now();
        let _guard = self.lock_state();
        let tombstones = self.mirror.load_tombstones();
        let rows: Vec<R> = self
            .pruned_queue(now)
            .into_iter()
            .filter(|r| !tombstones.contains(r.record_id()))
            .collect();
        let source = if rows.is_empty() {
            ViewSource::Empty
        } else {
            ViewSource::LocalQueue
        };
        MergedView::fallback(rows, source, None)
    }

    /// The last good view, or the initial view if nothing loaded yet.
    pub fn current_view(&self) -> MergedView<R> {
        let now = self.now();
        {
            let state = self.lock_state();
            if let Some(rows) = state.last_good.clone() {
                let stale = is_stale_at(&state, now);
                return MergedView {
                    rows,
                    source: ViewSource::MemoryCache,
                    stale,
                    loaded_at: state.loaded_at,
                };
            }
        }
        self.initial_view()
    }

    /// Cancel in-flight requests. They resolve as aborts.
    pub fn shutdown(&self) {
        self.remote.shutdown();
    }

    pub fn last_loaded_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().loaded_at
    }

    /// True when the last load is over a minute old, never happened, or the
    /// last refresh had to fall back to cached rows.
    pub fn is_stale(&self) -> bool {
        let now = self.now();
        is_stale_at(&self.lock_state(), now)
    }

    /// Fetch and reconcile.
    ///
    /// Transient failures resolve to a stale fallback view; any other
    /// failure is returned to the caller.
    pub async fn refresh(&self) -> SyncResult<MergedView<R>> {
        debug!(resource = %self.resource, "refreshing list");
        let fetched = self
            .remote
            .fetch_list(&self.resource, self.timeouts.list)
            .await;
        let now = self.now();

        match fetched {
            Ok(raw) => {
                let total = raw.len();
                let server_rows = decode_rows::<R>(raw, MAX_LIST_ROWS);
                if total > MAX_LIST_ROWS {
                    debug!(resource = %self.resource, total, kept = MAX_LIST_ROWS, "server list truncated");
                }
                Ok(self.apply_server_rows(server_rows, now))
            }
            Err(e) if e.is_transient() => {
                warn!(resource = %self.resource, error = %e, "list fetch failed transiently, serving cached rows");
                Ok(self.fallback_view(now))
            }
            Err(e) => {
                error!(resource = %self.resource, error = %e, "list fetch failed");
                Err(e.into())
            }
        }
    }

    fn apply_server_rows(&self, server_rows: Vec<R>, now: DateTime<Utc>) -> MergedView<R> {
        let mut state = self.lock_state();

        let tombstones = self.pruned_tombstones(now);
        let queue = self.pruned_queue(now);
        let queued = queue.len();
        let outcome = merge_server_rows(server_rows, &tombstones, queue);
        if outcome.still_pending.len() != queued {
            self.mirror.save_optimistic(&outcome.still_pending);
        }

        info!(
            resource = %self.resource,
            rows = outcome.rows.len(),
            pending = outcome.still_pending.len(),
            confirmed = outcome.confirmed,
            "list reconciled"
        );

        state.last_good = Some(outcome.rows.clone());
        state.loaded_at = Some(now);
        state.source = Some(ViewSource::Server);

        MergedView {
            rows: outcome.rows,
            source: ViewSource::Server,
            stale: false,
            loaded_at: Some(now),
        }
    }

    /// Best prior data, in order: last good view, optimistic queue, empty.
    fn fallback_view(&self, now: DateTime<Utc>) -> MergedView<R> {
        let mut state = self.lock_state();
        let tombstones = self.mirror.load_tombstones();

        if let Some(cached) = state.last_good.as_ref() {
            let rows: Vec<R> = cached
                .iter()
                .filter(|r| !tombstones.contains(r.record_id()))
                .cloned()
                .collect();
            if !rows.is_empty() {
                debug!(resource = %self.resource, rows = rows.len(), "serving last good view");
                state.source = Some(ViewSource::MemoryCache);
                return MergedView::fallback(rows, ViewSource::MemoryCache, state.loaded_at);
            }
        }

        let rows: Vec<R> = self
            .pruned_queue(now)
            .into_iter()
            .filter(|r| !tombstones.contains(r.record_id()))
            .collect();
        if !rows.is_empty() {
            debug!(resource = %self.resource, rows = rows.len(), "serving optimistic queue");
            state.source = Some(ViewSource::LocalQueue);
            return MergedView::fallback(rows, ViewSource::LocalQueue, state.loaded_at);
        }

        state.source = Some(ViewSource::Empty);
        MergedView::fallback(Vec::new(), ViewSource::Empty, state.loaded_at)
    }
}

fn is_stale_at<R>(state: &ViewState<R>, now: DateTime<Utc>) -> bool {
    match (state.loaded_at, state.source) {
        (Some(at), Some(ViewSource::Server)) => (now - at).num_milliseconds() > STALE_AFTER_MS,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, SyncError};
    use crate::models::Recovery;
    use crate::testing::{fixed_now, memory_cache, recovery, FakeRemote};
    use serde_json::json;

    fn ids(rows: &[Recovery]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_merge_hides_tombstoned_server_rows() {
        let tombstones: BTreeSet<String> = ["R1".to_string()].into_iter().collect();
        let outcome = merge_server_rows(
            vec![recovery("R1", "Acme", "2025-01-01", 100.0)],
            &tombstones,
            Vec::new(),
        );
        assert!(outcome.rows.is_empty());
    }

    #[test]
    fn test_merge_confirms_by_id_request_id_and_fingerprint() {
        let mut by_request = recovery("temp-2", "Bharat", "2025-02-02", 10.0);
        by_request.client_request_id = Some("req-1".into());
        let mut server_echo = recovery("R20", "Bharat Fuels", "2025-02-02", 10.0);
        server_echo.client_request_id = Some("req-1".into());

        let outcome = merge_server_rows(
            vec![
                recovery("R1", "Acme", "2025-01-01", 5.0),
                server_echo,
                recovery("R9", "Acme", "2025-02-01", 50.0),
            ],
            &BTreeSet::new(),
            vec![
                recovery("R1", "Acme", "2025-01-01", 5.0),
                by_request,
                recovery("temp-3", "Acme", "2025-02-01", 50.0),
                recovery("temp-4", "Zenith", "2025-02-03", 75.0),
            ],
        );

        assert_eq!(outcome.confirmed, 3);
        assert_eq!(ids(&outcome.still_pending), vec!["temp-4"]);
        assert_eq!(ids(&outcome.rows), vec!["R1", "R20", "R9", "temp-4"]);
    }

    #[test]
    fn test_merge_drops_tombstoned_queue_rows() {
        let tombstones: BTreeSet<String> = ["temp-4".to_string()].into_iter().collect();
        let outcome = merge_server_rows(
            Vec::new(),
            &tombstones,
            vec![recovery("temp-4", "Zenith", "2025-02-03", 75.0)],
        );
        assert!(outcome.rows.is_empty());
        assert!(outcome.still_pending.is_empty());
        assert_eq!(outcome.confirmed, 0);
    }

    #[test]
    fn test_decode_rows_caps_and_skips_malformed() {
        let mut raw: Vec<Value> = (0..60).map(|i| json!({ "id": format!("R{i}") })).collect();
        raw[0] = json!({ "id": "R0", "received_amount": { "nested": true }, "customer_name": 7 });
        let rows: Vec<Recovery> = decode_rows(raw, MAX_LIST_ROWS);
        assert_eq!(rows.len(), MAX_LIST_ROWS - 1);
        assert_eq!(rows[0].id, "R1");
    }

    #[tokio::test]
    async fn test_tombstoned_row_stays_hidden_when_server_returns_it() {
        let cache = memory_cache(FakeRemote::new());
        cache.mirror().save_tombstones(&["R1".to_string()].into_iter().collect());
        cache
            .remote()
            .push_list(Ok(vec![json!({"id": "R1", "received_amount": 100, "recovery_date": "2025-01-01"})]));

        let view = cache.refresh().await.unwrap();
        assert!(view.rows.is_empty());
        assert_eq!(view.source, ViewSource::Server);
        assert!(!view.stale);
    }

    #[tokio::test]
    async fn test_server_confirmation_empties_queue() {
        let cache = memory_cache(FakeRemote::new());
        cache.mirror().save_optimistic(&[recovery(
            &format!("temp-{}", fixed_now().timestamp_millis() - 60_000),
            "Acme",
            "2025-02-01",
            50.0,
        )]);
        cache.remote().push_list(Ok(vec![json!({
            "id": "R9", "received_amount": 50, "recovery_date": "2025-02-01", "customer_name": "Acme"
        })]));

        let view = cache.refresh().await.unwrap();
        assert_eq!(ids(&view.rows), vec!["R9"]);
        assert!(cache.mirror().load_optimistic::<Recovery>().is_empty());
    }

    #[tokio::test]
    async fn test_pending_rows_follow_server_rows() {
        let cache = memory_cache(FakeRemote::new());
        let pending_id = format!("temp-{}", fixed_now().timestamp_millis() - 1_000);
        cache
            .mirror()
            .save_optimistic(&[recovery(&pending_id, "Zenith", "2025-02-03", 75.0)]);
        cache.remote().push_list(Ok(vec![json!({"id": "R1", "customer_name": "Acme"})]));

        let view = cache.refresh().await.unwrap();
        assert_eq!(ids(&view.rows), vec!["R1", pending_id.as_str()]);
        assert_eq!(cache.mirror().load_optimistic::<Recovery>().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_keeps_last_good_view() {
        let cache = memory_cache(FakeRemote::new());
        cache.remote().push_list(Ok(vec![
            json!({"id": "R1"}),
            json!({"id": "R2"}),
            json!({"id": "R3"}),
        ]));
        let first = cache.refresh().await.unwrap();
        assert_eq!(first.rows.len(), 3);

        cache
            .remote()
            .push_list(Err(FetchError::TimedOut("Request to fetch recoveries timed out after 20000ms".into())));
        let second = cache.refresh().await.unwrap();
        assert_eq!(ids(&second.rows), vec!["R1", "R2", "R3"]);
        assert_eq!(second.source, ViewSource::MemoryCache);
        assert!(second.stale);
        assert!(cache.is_stale());
        assert_eq!(second.loaded_at, first.loaded_at);
    }

    #[tokio::test]
    async fn test_transient_failure_without_cache_uses_queue_then_empty() {
        let cache = memory_cache(FakeRemote::new());
        cache
            .remote()
            .push_list(Err(FetchError::Transient("server busy".into())));
        let view = cache.refresh().await.unwrap();
        assert!(view.rows.is_empty());
        assert_eq!(view.source, ViewSource::Empty);

        let pending_id = format!("temp-{}", fixed_now().timestamp_millis());
        cache
            .mirror()
            .save_optimistic(&[recovery(&pending_id, "Acme", "2025-02-01", 50.0)]);
        cache
            .remote()
            .push_list(Err(FetchError::Transient("Cannot reach back-office server".into())));
        let view = cache.refresh().await.unwrap();
        assert_eq!(ids(&view.rows), vec![pending_id.as_str()]);
        assert_eq!(view.source, ViewSource::LocalQueue);
    }

    #[tokio::test]
    async fn test_fallback_filters_rows_deleted_since_last_load() {
        let cache = memory_cache(FakeRemote::new());
        cache
            .remote()
            .push_list(Ok(vec![json!({"id": "R1"}), json!({"id": "R2"})]));
        cache.refresh().await.unwrap();

        cache.mirror().save_tombstones(&["R1".to_string()].into_iter().collect());
        cache
            .remote()
            .push_list(Err(FetchError::TimedOut("timed out".into())));
        let view = cache.refresh().await.unwrap();
        assert_eq!(ids(&view.rows), vec!["R2"]);
    }

    #[tokio::test]
    async fn test_hard_failure_propagates_and_keeps_cache() {
        let cache = memory_cache(FakeRemote::new());
        cache.remote().push_list(Ok(vec![json!({"id": "R1"})]));
        cache.refresh().await.unwrap();

        cache
            .remote()
            .push_list(Err(FetchError::Rejected("Malformed response to fetch recoveries (HTTP 200)".into())));
        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert_eq!(ids(&cache.current_view().rows), vec!["R1"]);
    }

    #[tokio::test]
    async fn test_refresh_prunes_expired_temp_rows_and_tombstones() {
        let cache = memory_cache(FakeRemote::new());
        let now = fixed_now();
        let expired = format!("temp-{}", (now - ChronoDuration::hours(3)).timestamp_millis());
        let old_tombstone = format!("temp-{}", (now - ChronoDuration::hours(25)).timestamp_millis());
        cache
            .mirror()
            .save_optimistic(&[recovery(&expired, "Acme", "2025-02-01", 50.0)]);
        cache
            .mirror()
            .save_tombstones(&[old_tombstone, "R5".to_string()].into_iter().collect());

        let view = cache.refresh().await.unwrap();
        assert!(view.rows.is_empty());
        assert!(cache.mirror().load_optimistic::<Recovery>().is_empty());
        let expected: BTreeSet<String> = ["R5".to_string()].into_iter().collect();
        assert_eq!(cache.mirror().load_tombstones(), expected);
    }

    #[tokio::test]
    async fn test_staleness_tracks_clock() {
        let now = Arc::new(Mutex::new(fixed_now()));
        let clock_now = now.clone();
        let cache = memory_cache(FakeRemote::new())
            .with_clock(Arc::new(move || *clock_now.lock().unwrap()));
        assert!(cache.is_stale());

        cache.remote().push_list(Ok(vec![json!({"id": "R1"})]));
        cache.refresh().await.unwrap();
        assert!(!cache.is_stale());

        *now.lock().unwrap() = fixed_now() + ChronoDuration::seconds(61);
        assert!(cache.is_stale());
        assert!(cache.current_view().stale);
    }

    #[test]
    fn test_initial_view_reads_pruned_queue() {
        let cache = memory_cache(FakeRemote::new());
        let now = fixed_now();
        let fresh = format!("temp-{}", now.timestamp_millis());
        let expired = format!("temp-{}", (now - ChronoDuration::hours(5)).timestamp_millis());
        cache.mirror().save_optimistic(&[
            recovery(&fresh, "Acme", "2025-02-01", 1.0),
            recovery(&expired, "Acme", "2025-02-01", 2.0),
            recovery("temp-deleted", "Acme", "2025-02-01", 3.0),
        ]);
        cache
            .mirror()
            .save_tombstones(&["temp-deleted".to_string()].into_iter().collect());

        let view = cache.initial_view();
        assert_eq!(ids(&view.rows), vec![fresh.as_str()]);
        assert_eq!(view.source, ViewSource::LocalQueue);
        assert!(view.stale);
    }
}
