//! Audit event bus.
//!
//! Every state change and approval lifecycle step is published as a
//! [`GateEvent`] on a [`tokio::sync::broadcast`] channel.  Events are wrapped
//! in [`Arc`] so fan-out to several subscribers never clones the payload.
//!
//! Publishing never fails: with no subscribers the event is dropped, which is
//! the normal situation in tests and one-shot CLI commands.
//!
//! ```rust,no_run
//! # use gatehouse_kernel::bus::{EventBus, GateEvent};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(GateEvent::System {
//!     kind: "startup".into(),
//!     message: "server listening".into(),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::approval::{ApprovalStatus, DecisionAction};
use crate::intent::RoutingLayer;
use crate::risk::ApprovalTier;
use crate::state::RequestState;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GateEvent {
    /// A request's context moved along an edge of the state graph.
    StateChanged {
        request_id: String,
        from: RequestState,
        to: RequestState,
        reason: String,
        at: DateTime<Utc>,
    },

    /// The cascade froze a routing decision.
    Routed {
        request_id: String,
        layer: RoutingLayer,
        summary: String,
        confidence: f64,
        latency_us: u64,
    },

    ApprovalCreated {
        approval_id: String,
        request_id: String,
        tier: ApprovalTier,
        expires_at: DateTime<Utc>,
    },

    ApprovalResolved {
        approval_id: String,
        request_id: String,
        status: ApprovalStatus,
        action: Option<DecisionAction>,
        actor: Option<String>,
    },

    /// A new approval superseded an old one at a higher tier.
    ApprovalEscalated {
        request_id: String,
        from_approval: String,
        to_approval: String,
        tier: ApprovalTier,
    },

    /// Anything that does not fit the above (startup, reloads).
    System { kind: String, message: String },
}

impl GateEvent {
    /// The request this event is about, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::StateChanged { request_id, .. }
            | Self::Routed { request_id, .. }
            | Self::ApprovalCreated { request_id, .. }
            | Self::ApprovalResolved { request_id, .. }
            | Self::ApprovalEscalated { request_id, .. } => Some(request_id),
            Self::System { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Cheaply cloneable broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<GateEvent>>,
}

impl EventBus {
    /// Lagging subscribers beyond `capacity` get
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of receivers that will see the event.
    pub fn publish(&self, event: GateEvent) -> usize {
        match self.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Events published before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GateEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
