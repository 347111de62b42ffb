use eventmesh_core::models::ClientId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::Event;

/// Default capacity of a client's outbound event queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Result of a non-blocking enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Event was queued for delivery
    Delivered,
    /// Queue was full; the event was shed
    Dropped,
    /// The consumer side of the queue is gone
    Closed,
}

/// Process-local handle for one open client connection.
///
/// Owns the bounded outbound queue and the done-signal that bounds the
/// connection's lifetime. Cloneable; the receiver half of the queue is
/// returned once from [`ClientHandle::new`] and driven by the transport.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    sender: mpsc::Sender<Event>,
    done: CancellationToken,
}

impl ClientHandle {
    #[must_use]
    pub fn new(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                id,
                sender,
                done: CancellationToken::new(),
            },
            receiver,
        )
    }

    #[must_use]
    pub const fn id(&self) -> &ClientId {
        &self.id
    }

    /// Non-blocking enqueue. A full queue sheds the event rather than
    /// blocking the publisher; the drop is logged and is not an error.
    pub fn try_enqueue(&self, event: Event) -> EnqueueOutcome {
        match self.sender.try_send(event) {
            Ok(()) => EnqueueOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    client_id = %self.id,
                    event_type = %event.event_type,
                    "Client queue full, dropping event"
                );
                EnqueueOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client_id = %self.id, "Client queue closed, event not delivered");
                EnqueueOutcome::Closed
            }
        }
    }

    /// The one-shot done-signal bounding this connection's lifetime
    #[must_use]
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Fire the done-signal, stopping the heartbeat task and the stream loop
    pub fn close(&self) {
        self.done.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }
}
