//! Correlation of replies to in-flight calls.
//!
//! Every call owns one `PendingCall` in the `CorrelationTable`, keyed by a
//! random `CorrelationId`. Two event sources race to settle it: the reply
//! dispatcher and the call's deadline task. Both go through
//! [`CorrelationTable::claim`], which removes the entry under the table lock,
//! so exactly one of them gets the `PendingCall` and the other sees `None`.
//!
//! ```text
//! call()  ──► register(id) ──► arm deadline ──► publish
//!                 │
//!        ┌────────┴─────────┐
//!   reply arrives      deadline fires
//!   claim(id)          claim(id)
//!   settle(result)     expire()
//! ```

use crate::error::{Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Opaque token matching a reply to its call.
///
/// Random (UUID v4) rather than sequential so ids stay unique across
/// reconnects and client instances sharing a reply exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from message metadata. Returns `None` for foreign formats.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write-once slot the caller's future reads from.
pub type ResultSink = oneshot::Sender<Result<Value>>;

/// Bookkeeping for one in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    pub service: String,
    pub method: String,
    sink: ResultSink,
    deadline: Option<AbortHandle>,
}

impl PendingCall {
    pub fn new(service: impl Into<String>, method: impl Into<String>, sink: ResultSink) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            sink,
            deadline: None,
        }
    }

    /// Attach the deadline task so a reply can cancel it.
    pub fn with_deadline(mut self, deadline: AbortHandle) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// `service.method` of the call.
    pub fn target(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }

    /// Cancel the deadline and deliver the outcome.
    ///
    /// Returns `false` when the caller already dropped its future.
    pub fn settle(mut self, outcome: Result<Value>) -> bool {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        self.sink.send(outcome).is_ok()
    }

    /// Reject with a timeout. Called from the deadline task itself.
    pub fn expire(mut self, timeout: Duration) -> bool {
        self.deadline = None;
        let err = RpcError::Timeout {
            service: self.service.clone(),
            method: self.method.clone(),
            timeout,
        };
        self.sink.send(Err(err)).is_ok()
    }
}

/// Table of in-flight calls keyed by correlation id.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    calls: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingCall>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call under a fresh id, building it while the table lock is held.
    ///
    /// `build` typically spawns the deadline task; holding the lock guarantees
    /// that task cannot claim the id before the entry exists. The id is
    /// regenerated in the (astronomically unlikely) case it is already pending.
    pub fn register(&self, build: impl FnOnce(CorrelationId) -> PendingCall) -> CorrelationId {
        let mut calls = self.lock();
        let mut id = CorrelationId::new();
        while calls.contains_key(&id) {
            id = CorrelationId::new();
        }
        calls.insert(id, build(id));
        id
    }

    /// Look up and remove a call in one step.
    ///
    /// At most one caller ever receives `Some` for a given id.
    pub fn claim(&self, id: &CorrelationId) -> Option<PendingCall> {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of calls awaiting a reply or deadline.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
