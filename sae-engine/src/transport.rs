//! Outbound event channel
//!
//! Events travel over an unbounded `tokio::sync::mpsc` channel. Buffer
//! payloads are owned `Vec<f32>`s that move through the channel; nothing is
//! copied after the engine allocates them.

use sae_common::events::EngineEvent;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Receiving half handed to whoever consumes engine events
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Sending half owned by the engine
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

/// Create a connected sender/receiver pair
pub fn channel() -> (EventSender, EventReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSender { sender }, receiver)
}

impl EventSender {
    /// Send one event; returns `false` if the consumer has gone away
    pub fn send(&self, event: EngineEvent) -> bool {
        trace!("Emitting {}", event.kind());
        if self.sender.send(event).is_err() {
            debug!("Event receiver closed; dropping event");
            return false;
        }
        true
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(EngineEvent::Error {
            message: message.into(),
        })
    }

    pub fn idle(&self) -> bool {
        self.send(EngineEvent::Idle)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
