//! Correlation bridge: read-after-write synchronization for callers.
//!
//! A caller generates a correlation ID, registers a waiter here, and only
//! then dispatches its command. The projection consumer resolves the
//! waiter once the event carrying that ID has been committed to the read
//! model; aggregate actors resolve it directly for deferred (non-persisted)
//! rejection events. Registration-before-dispatch closes the race where
//! the downstream event is published before anyone is listening for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::WaitError;
use crate::log::Recorded;

/// An event observed on the global feed, as delivered to a waiter.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A persisted event, delivered after the projection consumer's
    /// transaction for it committed. Receiving this guarantees the write
    /// is visible in the read model.
    Committed(Recorded),

    /// A deferred event: visible to the waiting caller, absent from
    /// durable history. Business rejections travel this way.
    Transient(TransientEvent),
}

impl FeedEvent {
    /// The event tag, regardless of delivery kind.
    pub fn event_type(&self) -> &str {
        match self {
            FeedEvent::Committed(r) => &r.event_type,
            FeedEvent::Transient(t) => &t.event_type,
        }
    }

    /// Whether this event reached durable history and the read model.
    pub fn is_committed(&self) -> bool {
        matches!(self, FeedEvent::Committed(_))
    }
}

/// A deferred event published by an aggregate actor.
#[derive(Debug, Clone)]
pub struct TransientEvent {
    /// Source aggregate type.
    pub aggregate_type: String,
    /// Source aggregate instance identifier.
    pub instance_id: String,
    /// Event tag.
    pub event_type: String,
    /// Event payload.
    pub payload: Value,
    /// Correlation ID of the originating request.
    pub correlation_id: String,
    /// When the rejection was produced. Transient events have no
    /// sequence, so this is their only ordering hint.
    pub occurred_at: DateTime<Utc>,
}

/// Registry of pending waiters keyed by correlation ID.
///
/// `Clone` is cheap; all clones share one registry.
#[derive(Clone, Default)]
pub struct CorrelationBridge {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<FeedEvent>>>>,
}

impl std::fmt::Debug for CorrelationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationBridge")
            .field("pending", &self.lock().len())
            .finish()
    }
}

impl CorrelationBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`.
    ///
    /// Must be called before the correlated command is dispatched. If a
    /// waiter is already registered under the same ID it is replaced and
    /// the old one observes [`WaitError::Dropped`].
    pub fn register(&self, correlation_id: &str) -> WaitTicket {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(correlation_id.to_owned(), tx);
        WaitTicket {
            correlation_id: correlation_id.to_owned(),
            rx,
            bridge: self.clone(),
        }
    }

    /// Resolve the waiter for `correlation_id` with `event`, if one is
    /// registered. Returns `true` if a waiter received the event.
    pub fn resolve(&self, correlation_id: &str, event: FeedEvent) -> bool {
        match self.lock().remove(correlation_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `correlation_id` without resolving it.
    pub fn abandon(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<FeedEvent>>> {
        // A poisoned lock still holds a valid waiter map.
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered wait, consumed by [`wait`](WaitTicket::wait).
#[derive(Debug)]
pub struct WaitTicket {
    correlation_id: String,
    rx: oneshot::Receiver<FeedEvent>,
    bridge: CorrelationBridge,
}

impl WaitTicket {
    /// The correlation ID this ticket is registered under.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Suspend until the correlated event arrives or `timeout` elapses.
    ///
    /// On timeout the registration is removed and [`WaitError::Timeout`]
    /// is returned; this is a liveness failure only, the write may still
    /// land in the read model afterwards.
    pub async fn wait(self, timeout: Duration) -> Result<FeedEvent, WaitError> {
        let WaitTicket {
            correlation_id,
            rx,
            bridge,
        } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(WaitError::Dropped),
            Err(_) => {
                bridge.abandon(&correlation_id);
                Err(WaitError::Timeout)
            }
        }
    }
}
