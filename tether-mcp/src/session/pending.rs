//! Outbound calls awaiting their response

use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{oneshot, Mutex};

use crate::protocol::{JsonRpcResponse, RequestId};
use crate::{McpError, McpResult};

/// How many abandoned ids are remembered for quiet discarding
const ABANDONED_MEMORY: usize = 1024;

/// Receiving half of a pending slot
pub type PendingSlot = oneshot::Receiver<McpResult<JsonRpcResponse>>;

/// Outcome of routing an inbound response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller
    Delivered,
    /// Late response for a call that was cancelled or timed out
    Discarded,
    /// No call ever waited for this id
    Unmatched,
}

#[derive(Default)]
struct PendingState {
    slots: HashMap<RequestId, oneshot::Sender<McpResult<JsonRpcResponse>>>,
    abandoned: VecDeque<RequestId>,
    abandoned_ids: HashSet<RequestId>,
    closed: Option<String>,
}

impl PendingState {
    fn remember_abandoned(&mut self, id: RequestId) {
        if !self.abandoned_ids.insert(id.clone()) {
            return;
        }
        self.abandoned.push_back(id);
        while self.abandoned.len() > ABANDONED_MEMORY {
            if let Some(oldest) = self.abandoned.pop_front() {
                self.abandoned_ids.remove(&oldest);
            }
        }
    }
}

/// Request id to single-resolution slot.
///
/// Every slot is removed exactly once: by its response, by `abandon`
/// (cancellation or timeout), by `remove`, or by `fail_all` at teardown.
pub struct PendingCalls {
    state: Mutex<PendingState>,
    max_pending: usize,
}

impl PendingCalls {
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            max_pending,
        }
    }

    pub async fn register(&self, id: RequestId) -> McpResult<PendingSlot> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.closed {
            return Err(McpError::ConnectionClosed {
                reason: reason.clone(),
            });
        }
        if state.slots.contains_key(&id) {
            return Err(McpError::DuplicateRequestId { id });
        }
        if state.slots.len() >= self.max_pending {
            return Err(McpError::Session {
                message: format!("too many pending calls (limit {})", self.max_pending),
            });
        }

        let (tx, rx) = oneshot::channel();
        state.slots.insert(id, tx);
        Ok(rx)
    }

    pub async fn resolve(&self, response: JsonRpcResponse) -> Resolution {
        let Some(id) = response.id.clone() else {
            return Resolution::Unmatched;
        };

        let mut state = self.state.lock().await;
        match state.slots.remove(&id) {
            // The caller may have given up between removal and delivery
            Some(slot) => match slot.send(Ok(response)) {
                Ok(()) => Resolution::Delivered,
                Err(_) => Resolution::Discarded,
            },
            None if state.abandoned_ids.contains(&id) => Resolution::Discarded,
            None => Resolution::Unmatched,
        }
    }

    /// Drop the slot and remember the id so a late response is discarded quietly
    pub async fn abandon(&self, id: &RequestId) {
        let mut state = self.state.lock().await;
        state.slots.remove(id);
        state.remember_abandoned(id.clone());
    }

    /// Drop the slot without remembering it (the request never left)
    pub async fn remove(&self, id: &RequestId) {
        self.state.lock().await.slots.remove(id);
    }

    /// Fail every remaining slot and refuse new registrations
    pub async fn fail_all(&self, reason: &str) -> usize {
        let mut state = self.state.lock().await;
        state.closed = Some(reason.to_string());
        let slots: Vec<_> = state.slots.drain().collect();
        let failed = slots.len();
        for (_, slot) in slots {
            let _ = slot.send(Err(McpError::ConnectionClosed {
                reason: reason.to_string(),
            }));
        }
        failed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.slots.is_empty()
    }
}
