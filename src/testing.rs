//! Test doubles shared by the cache tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::api::{Envelope, RemoteCollection};
use crate::error::FetchError;
use crate::models::Recovery;
use crate::reconcile::RecordCache;
use crate::storage::{LocalMirror, MemoryStore};

type Scripted<T> = Mutex<VecDeque<Result<T, FetchError>>>;

/// Scripted remote. Each call pops the next queued answer; an empty queue
/// answers with an empty list or `{ ok: true }`.
#[derive(Default)]
pub(crate) struct FakeRemote {
    lists: Scripted<Vec<Value>>,
    creates: Scripted<Envelope>,
    updates: Scripted<Envelope>,
    deletes: Scripted<Envelope>,
    calls: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
    keys: Mutex<Vec<String>>,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_list(&self, answer: Result<Vec<Value>, FetchError>) {
        self.lists.lock().unwrap().push_back(answer);
    }

    pub(crate) fn push_create(&self, answer: Result<Envelope, FetchError>) {
        self.creates.lock().unwrap().push_back(answer);
    }

    pub(crate) fn push_update(&self, answer: Result<Envelope, FetchError>) {
        self.updates.lock().unwrap().push_back(answer);
    }

    pub(crate) fn push_delete(&self, answer: Result<Envelope, FetchError>) {
        self.deletes.lock().unwrap().push_back(answer);
    }

    /// `"METHOD resource[/id]"` for every request, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    pub(crate) fn idempotency_keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn ok_envelope() -> Envelope {
        Envelope {
            ok: true,
            ..Envelope::default()
        }
    }
}

impl RemoteCollection for FakeRemote {
    async fn fetch_list(&self, resource: &str, _timeout: Duration) -> Result<Vec<Value>, FetchError> {
        self.record(format!("GET {resource}"));
        let next = self.lists.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn create(
        &self,
        resource: &str,
        body: Value,
        client_request_id: &str,
        _timeout: Duration,
    ) -> Result<Envelope, FetchError> {
        self.record(format!("POST {resource}"));
        self.bodies.lock().unwrap().push(body);
        self.keys.lock().unwrap().push(client_request_id.to_string());
        let next = self.creates.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Self::ok_envelope()))
    }

    async fn update(
        &self,
        resource: &str,
        id: &str,
        body: Value,
        _timeout: Duration,
    ) -> Result<Envelope, FetchError> {
        self.record(format!("PUT {resource}/{id}"));
        self.bodies.lock().unwrap().push(body);
        let next = self.updates.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Self::ok_envelope()))
    }

    async fn delete(&self, resource: &str, id: &str, _timeout: Duration) -> Result<Envelope, FetchError> {
        self.record(format!("DELETE {resource}/{id}"));
        let next = self.deletes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Self::ok_envelope()))
    }
}

pub(crate) fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 1, 12, 0, 0).unwrap()
}

/// Recovery cache over an in-memory mirror with the clock pinned to
/// [`fixed_now`].
pub(crate) fn memory_cache(remote: FakeRemote) -> RecordCache<Recovery, FakeRemote> {
    let mirror = LocalMirror::new(Arc::new(MemoryStore::new()), "recoveries");
    RecordCache::new("recoveries", remote, mirror).with_clock(Arc::new(fixed_now))
}

pub(crate) fn recovery(id: &str, customer: &str, date: &str, amount: f64) -> Recovery {
    Recovery {
        id: id.to_string(),
        customer_name: Some(customer.to_string()),
        recovery_date: Some(date.to_string()),
        received_amount: Some(amount),
        ..Recovery::default()
    }
}
