//! Cross-context message passing
//!
//! Another execution context (a second window, a second process attached to
//! the same storage) is reached through a [`ContextTransport`]. The host
//! decides what backs it; [`ContextBus`] is the in-process implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use super::ChangeEvent;

/// Default capacity of the bus channel
const DEFAULT_BUS_CAPACITY: usize = 256;

/// Identifies one execution context on a transport
pub type ContextId = u64;

/// A change notification tagged with the context that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMessage {
    pub origin: ContextId,
    pub event: ChangeEvent,
}

/// Channel between execution contexts sharing the same storage
///
/// Delivery is best-effort: messages posted while nobody listens are lost,
/// and ordering across contexts is not guaranteed.
pub trait ContextTransport: Send + Sync {
    /// Id of the context this endpoint belongs to
    fn context_id(&self) -> ContextId;

    /// Sends a message to every context, including this one
    fn post(&self, message: ContextMessage);

    /// Receives messages from every context, including this one
    fn incoming(&self) -> broadcast::Receiver<ContextMessage>;
}

/// In-process bus connecting several contexts
///
/// Every [`endpoint`](ContextBus::endpoint) gets a fresh context id.
#[derive(Debug, Clone)]
pub struct ContextBus {
    sender: broadcast::Sender<ContextMessage>,
    next_id: Arc<AtomicU64>,
}

impl ContextBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attaches a new context to the bus
    pub fn endpoint(&self) -> ContextEndpoint {
        ContextEndpoint {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender: self.sender.clone(),
        }
    }

    /// Number of contexts currently listening
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ContextBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One context's handle on a [`ContextBus`]
#[derive(Debug, Clone)]
pub struct ContextEndpoint {
    id: ContextId,
    sender: broadcast::Sender<ContextMessage>,
}

impl ContextTransport for ContextEndpoint {
    fn context_id(&self) -> ContextId {
        self.id
    }

    fn post(&self, message: ContextMessage) {
        if self.sender.send(message).is_err() {
            tracing::debug!("No contexts listening on the bus");
        }
    }

    fn incoming(&self) -> broadcast::Receiver<ContextMessage> {
        self.sender.subscribe()
    }
}
