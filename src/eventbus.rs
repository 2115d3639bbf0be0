//! Real-time fan-out & ref-counted subscriptions (spec §4.7).
//!
//! One room per session, grounded on the teacher's per-conversation
//! `broadcast::Sender<SseEvent>` (`runtime.rs`'s `ConversationHandle`). The
//! teacher relies on the HTTP connection's lifetime to know when a
//! subscriber goes away; here subscribe/unsubscribe are explicit,
//! ref-counted operations (spec §4.7), since there is no connection to
//! piggyback on — `EventBus` tracks the count itself, guarded by a short
//! critical section per §5's "shared resources" table.

use crate::config::HostConfig;
use crate::ids::SessionId;
use crate::model::SessionEvent;
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// What a subscriber sees instead of the next event when it falls behind
/// the bounded per-subscriber queue (spec §4.7 "Backpressure").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscriber fell more than the queue capacity behind; `skipped`
    /// events were dropped. Per spec it must reconnect and re-`snapshot`.
    Slow { skipped: u64 },
    /// The room was torn down (last ref-counted unsubscribe, or the
    /// session itself is gone).
    Closed,
}

struct Room {
    tx: broadcast::Sender<SessionEvent>,
    ref_count: usize,
}

/// Typed pub/sub over session rooms with ref-counted subscriptions.
pub struct EventBus {
    rooms: Mutex<HashMap<SessionId, Room>>,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            queue_capacity: config.subscriber_outbound_queue,
        }
    }

    /// Join `session_id`'s room, creating it if this is the first
    /// subscriber. Reconnecting is idempotent: a client may call this
    /// again after a `Slow` disconnect without double-counting beyond
    /// what it explicitly unsubscribed.
    pub async fn subscribe(&self, session_id: &SessionId) -> broadcast::Receiver<SessionEvent> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(session_id.clone()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(self.queue_capacity.max(1));
            Room { tx, ref_count: 0 }
        });
        room.ref_count += 1;
        room.tx.subscribe()
    }

    /// Leave `session_id`'s room. The room itself is torn down once the
    /// ref count reaches zero; a subsequent `publish` for a session with
    /// no room is a harmless no-op (invariant: counters non-negative).
    pub async fn unsubscribe(&self, session_id: &SessionId) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(session_id) else {
            return;
        };
        room.ref_count = room.ref_count.saturating_sub(1);
        if room.ref_count == 0 {
            rooms.remove(session_id);
            debug!(%session_id, "event bus room closed, no subscribers left");
        }
    }

    pub async fn ref_count(&self, session_id: &SessionId) -> usize {
        self.rooms
            .lock()
            .await
            .get(session_id)
            .map_or(0, |room| room.ref_count)
    }

    /// Fan out `event` to every current subscriber of `event.context.session_id`.
    /// Delivery order within one `(sessionId, conversationId)` is FIFO by
    /// construction: callers (the single-threaded `Session` executor)
    /// publish in emission order over one `broadcast::Sender`.
    pub async fn publish(&self, session_id: &SessionId, event: SessionEvent) {
        let rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(session_id) {
            // No receivers is not an error: a session can run with zero
            // live subscribers (e.g. between client reconnects).
            let _ = room.tx.send(event);
        }
    }
}

/// Translate a raw `broadcast::Receiver` recv outcome into the bus's typed
/// contract, so callers don't need to know about `broadcast::error::RecvError`.
pub async fn recv(rx: &mut broadcast::Receiver<SessionEvent>) -> Result<SessionEvent, SubscriptionError> {
    match rx.recv().await {
        Ok(event) => Ok(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => Err(SubscriptionError::Slow { skipped }),
        Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
    }
}
