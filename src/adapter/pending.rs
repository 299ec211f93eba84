//! Pending Request Table
//!
//! Maps request ids to callers waiting for a terminal outcome.
//!
//! Every entry leaves the table exactly once, through `resolve`, `expire`,
//! `fail_via` or `fail_all`, and each of those removes the entry under the
//! table lock before the caller is notified. Whichever path removes it first
//! wins; the others find nothing to do. Recently resolved ids are remembered
//! in a bounded ring so a late response can be told apart from one that never
//! matched anything.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{NodeId, OcppResult, RequestId, ResultCode};
use crate::error::EngineError;

pub const DEFAULT_RECENT_MEMORY: usize = 1024;

/// Deadline used when `timeout` would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// How a pending request ended.
#[derive(Debug, Clone)]
pub enum Resolution {
    Completed(OcppResult),
    TimedOut,
    Cancelled,
    TransportFailed(String),
    /// Unexpected local fault after the request was registered.
    Faulted(String),
}

/// What the table needs to know about a request handed to the transport.
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    pub request_id: RequestId,
    pub action: String,
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub timeout: Duration,
}

struct PendingEntry {
    sender: oneshot::Sender<OcppResult>,
    action: String,
    next_hop: NodeId,
    submitted_at: Instant,
    deadline: Instant,
    timeout: Duration,
    /// Cancelled once the entry leaves the table, releasing any watcher task.
    done: CancellationToken,
}

/// Counters since the table was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingStats {
    pub registered: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub failed: u64,
    /// Late or unmatched responses that were dropped.
    pub discarded: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

struct Inner {
    entries: HashMap<RequestId, PendingEntry>,
    recent: VecDeque<RequestId>,
    recent_set: HashSet<RequestId>,
    recent_capacity: usize,
}

impl Inner {
    fn remember(&mut self, id: RequestId) {
        if self.recent_set.insert(id.clone()) {
            self.recent.push_back(id);
        }
        while self.recent.len() > self.recent_capacity {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
    }

    fn take(&mut self, id: &RequestId) -> Option<PendingEntry> {
        let entry = self.entries.remove(id)?;
        self.remember(id.clone());
        Some(entry)
    }

    fn take_where(&mut self, predicate: impl Fn(&PendingEntry) -> bool) -> Vec<(RequestId, PendingEntry)> {
        let ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.take(&id).map(|entry| (id, entry)))
            .collect()
    }
}

pub struct PendingRequestTable {
    inner: Mutex<Inner>,
    counters: Counters,
}

impl PendingRequestTable {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recent: VecDeque::new(),
                recent_set: HashSet::new(),
                recent_capacity: recent_capacity.max(1),
            }),
            counters: Counters::default(),
        }
    }

    /// Registers a request. Returns the receiver its outcome is delivered on
    /// and a token that fires when the entry leaves the table.
    pub fn insert(
        &self,
        registration: PendingRegistration,
    ) -> Result<(oneshot::Receiver<OcppResult>, CancellationToken), EngineError> {
        let (sender, receiver) = oneshot::channel();
        let done = CancellationToken::new();
        let now = Instant::now();
        let deadline = now
            .checked_add(registration.timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        {
            let mut inner = self.inner.lock();
            if inner.entries.contains_key(&registration.request_id) {
                return Err(EngineError::DuplicateRequestId(registration.request_id));
            }
            inner.entries.insert(
                registration.request_id.clone(),
                PendingEntry {
                    sender,
                    action: registration.action.clone(),
                    next_hop: registration.next_hop.clone(),
                    submitted_at: now,
                    deadline,
                    timeout: registration.timeout,
                    done: done.clone(),
                },
            );
        }
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %registration.request_id,
            action = %registration.action,
            destination = %registration.destination,
            next_hop = %registration.next_hop,
            timeout_ms = registration.timeout.as_millis() as u64,
            "Registered pending request"
        );
        Ok((receiver, done))
    }

    /// Returns false if the request was not (or no longer) pending.
    pub fn resolve(&self, request_id: &RequestId, resolution: Resolution) -> bool {
        let entry = self.inner.lock().take(request_id);
        match entry {
            Some(entry) => {
                self.deliver(request_id, entry, resolution);
                true
            }
            None => false,
        }
    }

    /// Times out every entry whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> usize {
        let expired = self.inner.lock().take_where(|entry| entry.deadline <= now);
        let count = expired.len();
        for (id, entry) in expired {
            self.deliver(&id, entry, Resolution::TimedOut);
        }
        count
    }

    /// Fails every request that was handed to `next_hop`.
    pub fn fail_via(&self, next_hop: &NodeId, reason: &str) -> usize {
        let failed = self.inner.lock().take_where(|entry| entry.next_hop == *next_hop);
        let count = failed.len();
        for (id, entry) in failed {
            self.deliver(&id, entry, Resolution::TransportFailed(reason.to_string()));
        }
        count
    }

    pub fn fail_all(&self, reason: &str) -> usize {
        let failed = self.inner.lock().take_where(|_| true);
        let count = failed.len();
        for (id, entry) in failed {
            self.deliver(&id, entry, Resolution::TransportFailed(reason.to_string()));
        }
        count
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.inner.lock().entries.contains_key(request_id)
    }

    pub fn was_recently_resolved(&self, request_id: &RequestId) -> bool {
        self.inner.lock().recent_set.contains(request_id)
    }

    pub fn record_discarded(&self) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PendingStats {
        PendingStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }

    fn deliver(&self, request_id: &RequestId, entry: PendingEntry, resolution: Resolution) {
        let (result, counter, outcome) = match resolution {
            Resolution::Completed(result) => (result, &self.counters.completed, "completed"),
            Resolution::TimedOut => (
                OcppResult::timeout(entry.timeout),
                &self.counters.timed_out,
                "timed_out",
            ),
            Resolution::Cancelled => (OcppResult::cancelled(), &self.counters.cancelled, "cancelled"),
            Resolution::TransportFailed(reason) => (
                OcppResult::transport_failure(reason),
                &self.counters.failed,
                "transport_failed",
            ),
            Resolution::Faulted(reason) => (
                OcppResult::error(ResultCode::GenericProtocolError, reason),
                &self.counters.failed,
                "faulted",
            ),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        entry.done.cancel();
        debug!(
            request_id = %request_id,
            action = %entry.action,
            outcome,
            elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
            "Resolved pending request"
        );
        if entry.sender.send(result).is_err() {
            debug!(request_id = %request_id, "Caller stopped waiting before resolution");
        }
    }
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_MEMORY)
    }
}
