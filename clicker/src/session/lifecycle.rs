//! Lifecycle notifications from the supervisor to control surfaces.
//!
//! Delivery is best-effort and at-most-once per transition. A subscriber only
//! sees events published after it subscribed; nothing is replayed. A surface
//! that attaches late must read the durable pair instead (see
//! [`crate::session::control::ControlSurface::attach`]).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lagging subscribers lose the oldest events beyond this many
const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The server accepted the session for this channel
    Started { channel_id: String },
    /// The session ended (user stop, server close, or failure)
    Stopped,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::Started { channel_id } => write!(f, "Started({})", channel_id),
            LifecycleEvent::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Clone)]
pub struct LifecycleBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to whoever is listening right now. Returns the number of
    /// subscribers that will see it (zero is not an error).
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> LifecycleSubscription {
        LifecycleSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

pub struct LifecycleSubscription {
    rx: broadcast::Receiver<LifecycleEvent>,
}

impl LifecycleSubscription {
    /// Wait for the next event. Returns None once the bus is gone.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "lifecycle subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
