//! Correlation table — matches asynchronous agent responses to the public
//! requests waiting on them.
//!
//! Each in-flight multiplexed request owns a [`Waiter`]. The waiter's slot is
//! a oneshot sender keyed by request ID; [`PendingRequests::resolve`] takes
//! the sender out of the map and fires it. A waiter removes its own slot when
//! it times out or is dropped, so a late response finds nothing and is
//! discarded.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::envelope::ResponseEnvelope;
use crate::error::TunnelError;

/// How long a public request waits for its agent by default.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

struct Slot {
    /// Distinguishes reuses of the same request ID.
    seq: u64,
    tx: oneshot::Sender<ResponseEnvelope>,
}

/// Request ID → completion slot. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    next_seq: Arc<AtomicU64>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // Critical sections never panic midway, a poisoned map is still consistent.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a slot under a fresh random request ID.
    pub fn register(&self) -> Waiter {
        loop {
            if let Some(waiter) = self.register_id(new_request_id()) {
                return waiter;
            }
        }
    }

    /// Open a slot under `request_id`, or `None` if one is already pending.
    pub fn register_id(&self, request_id: String) -> Option<Waiter> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        match self.slots().entry(request_id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { seq, tx });
            }
        }
        Some(Waiter {
            request_id,
            seq,
            rx,
            table: self.clone(),
        })
    }

    /// Hand `response` to whoever waits on `request_id`.
    ///
    /// Returns `false` when nobody does (already answered, timed out, or never
    /// issued); the response is dropped.
    pub fn resolve(&self, request_id: &str, response: ResponseEnvelope) -> bool {
        let slot = self.slots().remove(request_id);
        match slot {
            Some(slot) => slot.tx.send(response).is_ok(),
            None => {
                debug!(request_id, "Response for timed-out or unknown request (dropped)");
                false
            }
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.slots().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    fn release(&self, request_id: &str, seq: u64) {
        let mut slots = self.slots();
        if slots.get(request_id).is_some_and(|slot| slot.seq == seq) {
            slots.remove(request_id);
        }
    }
}

/// The waiting half of one pending request.
pub struct Waiter {
    request_id: String,
    seq: u64,
    rx: oneshot::Receiver<ResponseEnvelope>,
    table: PendingRequests,
}

impl Waiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Block until the response arrives or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<ResponseEnvelope, TunnelError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TunnelError::SessionClosed),
            Err(_) => {
                debug!(request_id = %self.request_id, "Request timed out waiting for agent");
                Err(TunnelError::GatewayTimeout)
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.table.release(&self.request_id, self.seq);
    }
}

/// Random 128-bit request ID.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
