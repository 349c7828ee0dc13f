//! Broadcast module - Session change notifications
//!
//! An in-process publish/subscribe hub that also forwards security-relevant
//! changes to other execution contexts through a [`ContextTransport`].
//!
//! Events are edge-triggered "check now" signals. Receivers must re-read the
//! session store rather than trust the payload, and must not assume any
//! ordering across contexts.

mod transport;

pub use transport::{ContextBus, ContextEndpoint, ContextId, ContextMessage, ContextTransport};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::session::Namespace;

/// Capacity of the local listener channel
const DEFAULT_LISTENER_CAPACITY: usize = 256;

/// What happened to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Set,
    Remove,
}

/// A change notification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub namespace: Namespace,
    pub key: String,
    pub action: ChangeAction,
}

impl ChangeEvent {
    pub fn new(namespace: Namespace, key: impl Into<String>, action: ChangeAction) -> Self {
        Self {
            namespace,
            key: key.into(),
            action,
        }
    }

    /// True if this event concerns `namespace`/`key`
    pub fn is(&self, namespace: Namespace, key: &str) -> bool {
        self.namespace == namespace && self.key == key
    }
}

/// Callback invoked synchronously for each delivered event
pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Inner {
    handlers: RwLock<Vec<(u64, ChangeHandler)>>,
    next_handler_id: AtomicU64,
    listeners: broadcast::Sender<ChangeEvent>,
    transport: Option<Arc<dyn ContextTransport>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn deliver(&self, event: &ChangeEvent) {
        // Snapshot so handlers may subscribe/unsubscribe while running
        let handlers: Vec<ChangeHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }

        // No listeners is fine
        let _ = self.listeners.send(event.clone());
    }

    fn detach(&self, id: u64) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(handler_id, _)| *handler_id != id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Session change hub
///
/// Cloning is cheap; clones share handlers, listeners and transport.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// Creates a hub that only notifies the current context
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a hub connected to other contexts through `transport`
    ///
    /// Spawns the task that relays other contexts' events, so this must be
    /// called from within a Tokio runtime. The task stops when the last clone
    /// of the hub is dropped.
    pub fn with_transport(transport: Arc<dyn ContextTransport>) -> Self {
        let incoming = transport.incoming();
        let broadcaster = Self::build(Some(Arc::clone(&transport)));
        spawn_relay(
            Arc::downgrade(&broadcaster.inner),
            broadcaster.inner.shutdown.clone(),
            transport.context_id(),
            incoming,
        );
        broadcaster
    }

    fn build(transport: Option<Arc<dyn ContextTransport>>) -> Self {
        let (listeners, _rx) = broadcast::channel(DEFAULT_LISTENER_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                listeners,
                transport,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Announces a change to local subscribers and, for security-relevant
    /// namespaces, to other contexts
    pub fn publish(&self, namespace: Namespace, key: &str, action: ChangeAction) {
        let event = ChangeEvent::new(namespace, key, action);
        tracing::debug!("Publishing {:?} {}/{}", action, namespace, key);

        self.inner.deliver(&event);

        if namespace.is_security_relevant() {
            if let Some(transport) = &self.inner.transport {
                transport.post(ContextMessage {
                    origin: transport.context_id(),
                    event,
                });
            }
        }
    }

    /// Registers a synchronous handler
    ///
    /// The handler stays attached until the returned [`Subscription`] is
    /// dropped or [`unsubscribe`](Subscription::unsubscribe)d. Handlers run
    /// on the publishing task and must not block.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns a receiver for async consumers
    pub fn listen(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.listeners.subscribe()
    }

    /// Number of attached handlers
    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// True if this hub relays to other contexts
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_some()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("handlers", &self.handler_count())
            .field("listeners", &self.inner.listeners.receiver_count())
            .field(
                "context_id",
                &self.inner.transport.as_ref().map(|t| t.context_id()),
            )
            .finish()
    }
}

/// Handle returned by [`Broadcaster::subscribe`]
///
/// Dropping it detaches the handler.
#[must_use = "dropping the subscription detaches the handler"]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Detaches the handler
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.detach(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// Relays other contexts' events into this hub. Relayed events are delivered
// locally only, never posted back to the transport.
fn spawn_relay(
    inner: Weak<Inner>,
    shutdown: CancellationToken,
    own_id: ContextId,
    mut incoming: broadcast::Receiver<ContextMessage>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = incoming.recv() => match message {
                    Ok(message) if message.origin == own_id => continue,
                    Ok(message) => {
                        let Some(inner) = inner.upgrade() else { break };
                        tracing::debug!(
                            "Relaying {:?} {}/{} from context {}",
                            message.event.action,
                            message.event.namespace,
                            message.event.key,
                            message.origin
                        );
                        inner.deliver(&message.event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} cross-context events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Context relay for {} stopped", own_id);
    });
}
