//! The pending-call table: uid → awaiter for every call in flight.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::errors::CommError;

/// Outcome delivered to a caller's awaiter.
pub(crate) type CallOutcome = Result<Value, CommError>;

/// A handle uid the call exported as a by-reference parameter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExportedHandle {
    pub uid: u64,
    pub retain: bool,
}

struct PendingCall {
    tx: oneshot::Sender<CallOutcome>,
    exported: Vec<ExportedHandle>,
}

/// Table of in-flight outgoing calls.
///
/// Once `fail_all` ran, the table is closed: later registrations fail with
/// `ConnectionClosed` so no call can slip in during teardown.
pub(crate) struct PendingCalls {
    entries: HashMap<u64, PendingCall>,
    closed: bool,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            closed: false,
        }
    }

    /// Allocate the awaiter for `uid`. Must happen before the call frame is
    /// handed to the transport, so a fast return always finds its entry.
    pub(crate) fn register(
        &mut self,
        uid: u64,
        exported: Vec<ExportedHandle>,
    ) -> Result<oneshot::Receiver<CallOutcome>, CommError> {
        if self.closed {
            return Err(CommError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.entries.insert(uid, PendingCall { tx, exported });
        Ok(rx)
    }

    /// Remove a just-registered entry whose frame never made it out.
    pub(crate) fn discard(&mut self, uid: u64) -> Vec<ExportedHandle> {
        self.entries
            .remove(&uid)
            .map(|entry| entry.exported)
            .unwrap_or_default()
    }

    /// Deliver an outcome. An unknown uid yields `None` (late return after
    /// teardown; the caller drops it). The exported-handle list is handed
    /// back so the registry can release the single-use ones.
    pub(crate) fn complete(&mut self, uid: u64, outcome: CallOutcome) -> Option<Vec<ExportedHandle>> {
        let entry = self.entries.remove(&uid)?;
        // The caller may have abandoned its future; delivery failure is fine.
        let _ = entry.tx.send(outcome);
        Some(entry.exported)
    }

    /// Drain the table, rejecting every awaiter with `ConnectionClosed`,
    /// and refuse registrations from now on. Idempotent.
    pub(crate) fn fail_all(&mut self) -> usize {
        self.closed = true;
        let drained = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(CommError::ConnectionClosed));
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
