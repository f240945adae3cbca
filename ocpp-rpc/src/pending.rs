//! Pending-call table
//!
//! Tracks outbound calls awaiting a CALLRESULT or CALLERROR, keyed by message
//! id. Every entry owns a single-use oneshot sender; whichever of reply,
//! timeout eviction or close eviction removes the entry first is the one that
//! fires it, so a call resolves exactly once.
//!
//! The table is shared by callers, the reader task and the sweeper. All of
//! them go through one mutex that is never held across an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CallIdStrategy;
use crate::error::SessionError;
use crate::session::SessionState;

/// How a pending call was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error {
        code: String,
        description: String,
        details: Value,
    },
    Timeout,
    ConnectionClosed(String),
}

/// Generates message ids for outbound calls
#[derive(Debug)]
pub struct CallIdGenerator {
    strategy: CallIdStrategy,
    counter: AtomicU64,
}

impl CallIdGenerator {
    pub fn new(strategy: CallIdStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(1),
        }
    }

    /// Counter generator whose next id is `start`
    pub fn starting_at(start: u64) -> Self {
        Self {
            strategy: CallIdStrategy::Counter,
            counter: AtomicU64::new(start),
        }
    }

    /// Next candidate id; the table rejects it if still pending
    fn candidate(&self) -> String {
        match self.strategy {
            // fetch_add wraps on overflow
            CallIdStrategy::Counter => self.counter.fetch_add(1, Ordering::Relaxed).to_string(),
            CallIdStrategy::Uuid => Uuid::new_v4().to_string(),
        }
    }
}

struct PendingCall {
    action: String,
    issued_at: Instant,
    deadline: Instant,
    sink: oneshot::Sender<Outcome>,
}

impl PendingCall {
    fn fulfill(self, message_id: &str, outcome: Outcome) {
        if self.sink.send(outcome).is_err() {
            debug!("Caller for {} ({}) is gone, outcome discarded", message_id, self.action);
        }
    }
}

#[derive(Default)]
struct Inner {
    calls: HashMap<String, PendingCall>,
    /// Set once by `evict_all`; later registrations are refused
    closed: Option<String>,
}

/// Table of in-flight outbound calls for one session
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call under a caller-chosen id
    pub fn register(
        &self,
        message_id: impl Into<String>,
        action: impl Into<String>,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Outcome>, SessionError> {
        let message_id = message_id.into();
        let mut inner = self.inner.lock();

        if inner.closed.is_some() {
            return Err(SessionError::SessionNotOpen(SessionState::Closed));
        }
        if inner.calls.contains_key(&message_id) {
            warn!("Refusing duplicate call id {}", message_id);
            return Err(SessionError::DuplicateCallId(message_id));
        }

        let (sink, rx) = oneshot::channel();
        inner.calls.insert(
            message_id,
            PendingCall {
                action: action.into(),
                issued_at: Instant::now(),
                deadline,
                sink,
            },
        );
        Ok(rx)
    }

    /// Register a call under a freshly generated id
    ///
    /// Generation and insertion happen under the same lock, so the id cannot
    /// be taken between the two.
    pub fn register_next(
        &self,
        ids: &CallIdGenerator,
        action: impl Into<String>,
        deadline: Instant,
    ) -> Result<(String, oneshot::Receiver<Outcome>), SessionError> {
        let mut inner = self.inner.lock();

        if inner.closed.is_some() {
            return Err(SessionError::SessionNotOpen(SessionState::Closed));
        }

        // Terminates: the table holds finitely many ids out of 2^64.
        let message_id = loop {
            let candidate = ids.candidate();
            if !inner.calls.contains_key(&candidate) {
                break candidate;
            }
            debug!("Skipping call id {} (still pending)", candidate);
        };

        let (sink, rx) = oneshot::channel();
        inner.calls.insert(
            message_id.clone(),
            PendingCall {
                action: action.into(),
                issued_at: Instant::now(),
                deadline,
                sink,
            },
        );
        Ok((message_id, rx))
    }

    /// Resolve a pending call with a reply; returns false if the id was not pending
    pub fn resolve(&self, message_id: &str, outcome: Outcome) -> bool {
        let call = self.inner.lock().calls.remove(message_id);

        match call {
            Some(call) => {
                debug!(
                    "Resolved {} ({}) after {:?}",
                    message_id,
                    call.action,
                    call.issued_at.elapsed()
                );
                call.fulfill(message_id, outcome);
                true
            }
            None => {
                warn!(
                    "Dropping reply for unknown or already resolved call {}",
                    message_id
                );
                false
            }
        }
    }

    /// Remove a call whose caller stopped waiting, without fulfilling it
    pub fn cancel(&self, message_id: &str) -> bool {
        let removed = self.inner.lock().calls.remove(message_id);
        if let Some(call) = &removed {
            debug!("Call {} ({}) abandoned by caller", message_id, call.action);
        }
        removed.is_some()
    }

    /// Evict every call whose deadline is at or before `now`
    pub fn evict_expired(&self, now: Instant) -> Vec<String> {
        let expired: Vec<(String, PendingCall)> = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.calls.remove(&id).map(|call| (id, call)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(message_id, call)| {
                warn!("Call {} ({}) timed out", message_id, call.action);
                call.fulfill(&message_id, Outcome::Timeout);
                message_id
            })
            .collect()
    }

    /// Fail every pending call and refuse new ones; returns how many were evicted
    pub fn evict_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingCall)> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_string());
            }
            inner.calls.drain().collect()
        };

        let count = drained.len();
        for (message_id, call) in drained {
            call.fulfill(&message_id, Outcome::ConnectionClosed(reason.to_string()));
        }
        count
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.inner.lock().calls.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn later(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_resolve_fires_once() {
        let table = PendingTable::new();
        let rx = table.register("1", "Heartbeat", later(5)).unwrap();

        assert!(table.resolve("1", Outcome::Result(json!({"ok": true}))));
        assert!(!table.resolve("1", Outcome::Result(json!({"ok": false}))));

        assert_eq!(rx.await.unwrap(), Outcome::Result(json!({"ok": true})));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingTable::new();
        let _rx = table.register("abc", "Heartbeat", later(5)).unwrap();

        assert_eq!(
            table.register("abc", "Heartbeat", later(5)).unwrap_err(),
            SessionError::DuplicateCallId("abc".into())
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_id_leaves_others_alone() {
        let table = PendingTable::new();
        let mut rx = table.register("a", "Heartbeat", later(5)).unwrap();

        assert!(!table.resolve("zzz", Outcome::Result(json!({}))));
        assert!(table.contains("a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let table = PendingTable::new();
        let short = table.register("short", "Heartbeat", later(1)).unwrap();
        let _long = table.register("long", "Heartbeat", later(10)).unwrap();

        assert!(table.evict_expired(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(table.evict_expired(Instant::now()), vec!["short".to_string()]);
        assert_eq!(short.await.unwrap(), Outcome::Timeout);
        assert!(table.contains("long"));
    }

    #[tokio::test]
    async fn test_evict_all_closes_table() {
        let table = PendingTable::new();
        let receivers: Vec<_> = (0..3)
            .map(|i| table.register(i.to_string(), "Heartbeat", later(5)).unwrap())
            .collect();

        assert_eq!(table.evict_all("peer went away"), 3);

        for rx in receivers {
            assert_eq!(
                rx.await.unwrap(),
                Outcome::ConnectionClosed("peer went away".into())
            );
        }

        assert_eq!(
            table.register("late", "Heartbeat", later(5)).unwrap_err(),
            SessionError::SessionNotOpen(SessionState::Closed)
        );
        assert_eq!(table.evict_all("again"), 0);
    }

    #[test]
    fn test_cancel_removes_without_resolving() {
        let table = PendingTable::new();
        let mut rx = table.register("a", "Heartbeat", later(5)).unwrap();

        assert!(table.cancel("a"));
        assert!(!table.cancel("a"));
        // Sender dropped without a value
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_counter_wraps_and_skips_pending() {
        let table = PendingTable::new();
        let ids = CallIdGenerator::starting_at(u64::MAX);
        let _zero = table.register("0", "Heartbeat", later(5)).unwrap();

        let (first, _rx1) = table.register_next(&ids, "Heartbeat", later(5)).unwrap();
        let (second, _rx2) = table.register_next(&ids, "Heartbeat", later(5)).unwrap();

        assert_eq!(first, u64::MAX.to_string());
        assert_eq!(second, "1");
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let table = PendingTable::new();
        let ids = CallIdGenerator::new(CallIdStrategy::Uuid);

        let (a, _rx_a) = table.register_next(&ids, "Heartbeat", later(5)).unwrap();
        let (b, _rx_b) = table.register_next(&ids, "Heartbeat", later(5)).unwrap();

        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
