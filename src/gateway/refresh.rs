//! Single-flight refresh state machine
//!
//! `Idle -> Refreshing -> Settled(Success | Failed) -> Refreshing -> ...`
//!
//! The first caller to [`enter`](RefreshGate::enter) while no refresh is
//! running becomes the leader and receives a [`RefreshLease`]; everyone else
//! is queued until the leader completes the lease. Entry is synchronous so
//! the flag flips before the leader's first suspension point.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;

use super::error::GatewayError;
use super::types::RequestDescriptor;

/// Result delivered to a queued caller
pub(crate) type Settlement = Result<Value, GatewayError>;

/// How a refresh cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Fresh credentials are in the session store
    Success,
    /// Credentials were cleared; carries the reason
    Failed(String),
}

/// Observable phase of the refresh protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPhase {
    /// No refresh has run yet
    Idle,
    /// A refresh is in flight with this many queued callers
    Refreshing { queued: usize },
    /// The last refresh finished this way
    Settled(RefreshOutcome),
}

/// A request parked while a refresh is in flight
pub(crate) struct QueuedRequest {
    pub descriptor: RequestDescriptor,
    settle: oneshot::Sender<Settlement>,
}

impl QueuedRequest {
    /// Routes the result back to the original caller
    pub fn settle(self, result: Settlement) {
        if self.settle.send(result).is_err() {
            tracing::debug!("Queued caller for {} went away", self.descriptor.endpoint);
        }
    }
}

enum RefreshState {
    Idle,
    Refreshing(VecDeque<QueuedRequest>),
    Settled(RefreshOutcome),
}

/// What a caller got from [`RefreshGate::enter`]
pub(crate) enum RefreshTicket<'a> {
    /// Run the refresh, then complete the lease
    Leader(RefreshLease<'a>, RequestDescriptor),
    /// Wait for the leader to settle this request
    Queued(oneshot::Receiver<Settlement>),
}

/// Guards the refresh flag
pub(crate) struct RefreshGate {
    state: Mutex<RefreshState>,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Becomes leader, or queues `descriptor` behind the running refresh
    pub fn enter(&self, descriptor: RequestDescriptor) -> RefreshTicket<'_> {
        let mut state = self.lock();
        match &mut *state {
            RefreshState::Refreshing(queue) => {
                let (settle, waiter) = oneshot::channel();
                queue.push_back(QueuedRequest { descriptor, settle });
                tracing::debug!("Refresh in flight, queued request ({} waiting)", queue.len());
                RefreshTicket::Queued(waiter)
            }
            RefreshState::Idle | RefreshState::Settled(_) => {
                *state = RefreshState::Refreshing(VecDeque::new());
                RefreshTicket::Leader(RefreshLease { gate: self, completed: false }, descriptor)
            }
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        match &*self.lock() {
            RefreshState::Idle => RefreshPhase::Idle,
            RefreshState::Refreshing(queue) => RefreshPhase::Refreshing {
                queued: queue.len(),
            },
            RefreshState::Settled(outcome) => RefreshPhase::Settled(outcome.clone()),
        }
    }

    fn settle(&self, outcome: RefreshOutcome) -> VecDeque<QueuedRequest> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, RefreshState::Settled(outcome)) {
            RefreshState::Refreshing(queue) => queue,
            _ => VecDeque::new(),
        }
    }
}

/// Leadership of one refresh cycle
///
/// Dropping an uncompleted lease (the leader's future was cancelled) settles
/// the cycle as failed and drops every queued request, whose callers then
/// observe [`GatewayError::RefreshAbandoned`].
pub(crate) struct RefreshLease<'a> {
    gate: &'a RefreshGate,
    completed: bool,
}

impl RefreshLease<'_> {
    /// Releases the flag and hands back the queue in FIFO order
    pub fn complete(mut self, outcome: RefreshOutcome) -> VecDeque<QueuedRequest> {
        self.completed = true;
        self.gate.settle(outcome)
    }
}

impl Drop for RefreshLease<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let dropped = self
                .gate
                .settle(RefreshOutcome::Failed("refresh abandoned".to_string()));
            tracing::warn!("Refresh abandoned with {} queued requests", dropped.len());
        }
    }
}
