//! Concurrency-safe registries shared by the HTTP layer and the dispatcher
//!
//! Both maps are guarded by plain mutexes; every insert, lookup, and removal
//! happens under the lock so a reply can be taken at most once even while
//! the router is registering new entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::errors::AppError;
use crate::rpc::RequestId;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One in-flight request: the session whose SSE stream should receive the
/// eventual reply. Removed exactly once, by dispatch or by the expiry sweep.
pub struct PendingEntry {
    pub session_id: String,
    pub reply_tx: mpsc::Sender<String>,
    pub registered_at: Instant,
}

impl PendingEntry {
    pub fn new(session_id: impl Into<String>, reply_tx: mpsc::Sender<String>) -> Self {
        Self {
            session_id: session_id.into(),
            reply_tx,
            registered_at: Instant::now(),
        }
    }
}

#[derive(Default)]
pub struct PendingRegistry {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
    next_id: AtomicU64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Ids must be unique among currently pending requests; a duplicate is a
    /// caller error and never overwrites the earlier entry.
    pub fn register(&self, id: RequestId, entry: PendingEntry) -> Result<(), AppError> {
        let mut entries = locked(&self.entries);
        if entries.contains_key(&id) {
            return Err(AppError::bad_request(
                "duplicate_id",
                format!("request id {id} is already pending"),
            ));
        }
        entries.insert(id, entry);
        Ok(())
    }

    /// Read-and-remove under one lock, so a reply is delivered at most once.
    pub fn take(&self, id: &RequestId) -> Option<PendingEntry> {
        locked(&self.entries).remove(id)
    }

    /// Generate a numeric id and insert the entry under the same lock, so a
    /// concurrent caller supplying the same literal id can never slip in
    /// between generation and registration. Monotonic, scoped to the process.
    pub fn register_generated(&self, entry: PendingEntry) -> RequestId {
        let mut entries = locked(&self.entries);
        let id = loop {
            let candidate = RequestId::from_u64(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(id.clone(), entry);
        id
    }

    /// Remove and return every entry older than `bound`.
    pub fn sweep_expired(&self, bound: Duration) -> Vec<(RequestId, PendingEntry)> {
        let mut entries = locked(&self.entries);
        let expired: Vec<RequestId> = entries
            .iter()
            .filter(|(_, entry)| entry.registered_at.elapsed() >= bound)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub fn len(&self) -> usize {
        locked(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        locked(&self.entries).is_empty()
    }
}

pub struct SessionHandle {
    pub outbound: mpsc::Sender<String>,
    pub created_at: Instant,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: &str, outbound: mpsc::Sender<String>) {
        locked(&self.sessions).insert(
            session_id.to_string(),
            SessionHandle {
                outbound,
                created_at: Instant::now(),
            },
        );
    }

    pub fn sender_for(&self, session_id: &str) -> Option<mpsc::Sender<String>> {
        locked(&self.sessions)
            .get(session_id)
            .map(|handle| handle.outbound.clone())
    }

    pub fn remove(&self, session_id: &str) {
        locked(&self.sessions).remove(session_id);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        locked(&self.sessions).contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        locked(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        locked(&self.sessions).is_empty()
    }
}
