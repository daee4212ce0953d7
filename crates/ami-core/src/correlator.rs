//! Action correlation
//!
//! Every outbound action is stamped with a fresh uuid `ActionID`. Inbound
//! responses (and list-member events) carry the same id, which is how a
//! reply finds its way back to the caller that is awaiting it. Frames with
//! no pending ActionID fall through to the broadcast event stream.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{AmiError, AmiResult};
use crate::frame::{AmiEvent, AmiResponse};

enum PendingKind {
    /// Resolves on the first response frame
    Single,
    /// Resolves when the named terminating event arrives; the initial
    /// response and the list-member events are accumulated until then.
    List {
        terminator: String,
        response: Option<AmiResponse>,
        events: Vec<AmiEvent>,
    },
}

struct Pending {
    action: String,
    kind: PendingKind,
    tx: oneshot::Sender<AmiResult<AmiResponse>>,
}

/// Pending-call table keyed by ActionID
#[derive(Default)]
pub struct ActionCorrelator {
    pending: Mutex<HashMap<String, Pending>>,
}

impl ActionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-response action; returns the ActionID to stamp and
    /// the receiver the caller awaits.
    pub fn register(
        &self,
        action: &str,
    ) -> (String, oneshot::Receiver<AmiResult<AmiResponse>>) {
        self.register_inner(action, PendingKind::Single)
    }

    /// Register a list-style action terminated by `terminator`
    /// (e.g. `QueueStatus` / `QueueStatusComplete`).
    pub fn register_list(
        &self,
        action: &str,
        terminator: &str,
    ) -> (String, oneshot::Receiver<AmiResult<AmiResponse>>) {
        self.register_inner(
            action,
            PendingKind::List {
                terminator: terminator.to_string(),
                response: None,
                events: Vec::new(),
            },
        )
    }

    fn register_inner(
        &self,
        action: &str,
        kind: PendingKind,
    ) -> (String, oneshot::Receiver<AmiResult<AmiResponse>>) {
        let action_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            action_id.clone(),
            Pending {
                action: action.to_string(),
                kind,
                tx,
            },
        );
        (action_id, rx)
    }

    /// Drop a pending entry (timeout path); the receiver is already gone.
    pub fn forget(&self, action_id: &str) {
        self.pending.lock().remove(action_id);
    }

    /// Feed a response frame. Returns the frame back when no pending call
    /// matches it.
    pub fn accept_response(&self, response: AmiResponse) -> Option<AmiResponse> {
        let Some(action_id) = response.action_id().map(str::to_string) else {
            return Some(response);
        };
        let mut pending = self.pending.lock();
        let resolve_with = match pending.get_mut(&action_id) {
            None => return Some(response),
            Some(entry) => match &mut entry.kind {
                PendingKind::Single => Some(response),
                PendingKind::List { response: slot, .. } => {
                    if response.is_success() {
                        *slot = Some(response);
                        None
                    } else {
                        // An error response ends a list action; no Complete follows.
                        Some(response)
                    }
                }
            },
        };
        if let Some(response) = resolve_with {
            let entry = pending.remove(&action_id).expect("checked above");
            let _ = entry.tx.send(Self::finish(entry.action, response));
        }
        None
    }

    /// Feed an event frame. List-member events are absorbed; everything else
    /// is handed back for broadcast.
    pub fn accept_event(&self, event: AmiEvent) -> Option<AmiEvent> {
        let Some(action_id) = event.action_id().map(str::to_string) else {
            return Some(event);
        };
        let mut pending = self.pending.lock();
        let terminated = {
            let Some(entry) = pending.get_mut(&action_id) else {
                return Some(event);
            };
            let PendingKind::List {
                terminator, events, ..
            } = &mut entry.kind
            else {
                // Single-response actions never own events; pass it on.
                return Some(event);
            };
            if event.name == *terminator {
                true
            } else {
                events.push(event);
                false
            }
        };
        if terminated {
            let entry = pending.remove(&action_id).expect("checked above");
            let PendingKind::List {
                response, events, ..
            } = entry.kind
            else {
                unreachable!()
            };
            let result = match response {
                Some(mut response) => {
                    response.events = events;
                    Self::finish(entry.action, response)
                }
                // Terminator without an initial response still means the
                // list completed; hand back what we collected.
                None => Ok(AmiResponse {
                    fields: Default::default(),
                    events,
                }),
            };
            let _ = entry.tx.send(result);
        }
        None
    }

    /// Fail every pending call, used when the link drops
    pub fn fail_all(&self, error: AmiError) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            tracing::warn!(
                "Failing {} pending AMI action(s): {}",
                drained.len(),
                error
            );
        }
        for entry in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn finish(action: String, response: AmiResponse) -> AmiResult<AmiResponse> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(AmiError::action_failed(action, response.message()))
        }
    }
}
