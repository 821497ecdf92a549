//! Request/result correlation.
//!
//! Maps each in-flight request id to a one-shot reply slot. The inbound
//! transport task delivers into slots; callers wait on them. Every access to
//! the map goes through one lock, and a slot accepts at most one delivery.

use crate::error::{GatewayError, Result};
use crate::protocol::CommandResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// What a reply slot carries: a decoded result, or a transport error
/// synthesized when the command never reached the engine.
pub type Reply = Result<CommandResult>;

struct Slot {
    tx: Option<oneshot::Sender<Reply>>,
    rx: Option<oneshot::Receiver<Reply>>,
}

/// Concurrency-safe map from request id to reply slot.
#[derive(Default)]
pub struct CorrelationTable {
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reply slot for `id`.
    pub fn register(&self, id: Uuid) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&id) {
            return Err(GatewayError::AlreadyRegistered { id });
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(
            id,
            Slot {
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        Ok(())
    }

    /// Remove the slot for `id`, if any. Used to roll back a registration.
    pub fn unregister(&self, id: Uuid) -> bool {
        self.slots.lock().remove(&id).is_some()
    }

    /// Push a reply into the slot for `id` without blocking.
    ///
    /// Returns `false` when nobody is registered for `id`, or when the slot
    /// already holds a reply. The reply is dropped in both cases.
    pub fn deliver(&self, id: Uuid, reply: Reply) -> bool {
        let tx = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&id) {
                Some(slot) => slot.tx.take(),
                None => None,
            }
        };

        match tx {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Wait for the reply to `id`.
    ///
    /// The registration is consumed on every outcome: success, timeout, and
    /// a slot closed without a reply.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<CommandResult> {
        let rx = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&id).and_then(|slot| slot.rx.take()) {
                Some(rx) => rx,
                None => return Err(GatewayError::UnknownCommand { id }),
            }
        };

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.slots.lock().remove(&id);

        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(GatewayError::Disconnected { id }),
            Err(_) => {
                debug!("Timed out after {:?} waiting for {}", timeout, id);
                Err(GatewayError::ResultTimeout { id, timeout })
            }
        }
    }

    /// Whether a slot exists for `id`.
    pub fn contains(&self, id: Uuid) -> bool {
        self.slots.lock().contains_key(&id)
    }

    /// Number of outstanding registrations.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
