//! Broadcast bus between peer contexts.
//!
//! `BroadcastMedium` is the raw transport (a `BroadcastChannel`, a spool
//! directory, an in-process fan-out). `BroadcastBus` puts the typed
//! `BroadcastMessage` protocol on top of it.
//!
//! Delivery is fire-and-forget: unordered, not queued for late subscribers,
//! and never echoed back to the sender.

use crate::peer_id::PeerId;
use crate::platform::ThreadSafe;
use crate::subscription::Subscription;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("A handler is already subscribed on this bus")]
    AlreadySubscribed,
}

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BroadcastMessage {
    /// A poll result from the active poller.
    #[serde(rename = "newData")]
    NewData { data: serde_json::Value },
    /// Ask every receiver to add itself to the peer count.
    #[serde(rename = "countTabs")]
    CountTabs,
    /// A kind this version does not know. Never sent.
    #[serde(other, skip_serializing)]
    Unknown,
}

impl BroadcastMessage {
    pub fn encode(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(|e| BusError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, BusError> {
        serde_json::from_str(text).map_err(|e| BusError::Decode(e.to_string()))
    }
}

/// Raw fan-out transport carrying JSON text.
pub trait BroadcastMedium: ThreadSafe {
    fn publish(&self, text: &str) -> Result<(), BusError>;
}

/// Callback invoked once per message from another context.
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

/// A medium this crate can subscribe to directly.
///
/// The browser host receives messages in JavaScript and forwards them itself,
/// so its medium is publish-only.
pub trait ObservableMedium: BroadcastMedium {
    fn subscribe(&self, callback: MessageCallback) -> Subscription;
}

/// Typed bus over a medium. Clones share the single-subscriber slot.
#[derive(Clone)]
pub struct BroadcastBus<M> {
    medium: M,
    subscribed: Arc<AtomicBool>,
}

impl<M: BroadcastMedium> BroadcastBus<M> {
    pub fn new(medium: M) -> Self {
        Self {
            medium,
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn publish(&self, message: &BroadcastMessage) -> Result<(), BusError> {
        let text = message.encode()?;
        self.medium.publish(&text)
    }
}

impl<M: ObservableMedium> BroadcastBus<M> {
    /// Register this peer's handler. Only one handler per bus.
    ///
    /// Malformed and unknown messages are dropped before reaching the handler.
    pub fn subscribe(
        &self,
        handler: impl Fn(BroadcastMessage) + Send + Sync + 'static,
    ) -> Result<Subscription, BusError> {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(BusError::AlreadySubscribed);
        }

        let inner = self.medium.subscribe(Arc::new(move |text: String| {
            match BroadcastMessage::decode(&text) {
                Ok(BroadcastMessage::Unknown) => debug!("ignoring message of unknown kind"),
                Ok(message) => handler(message),
                Err(e) => debug!("ignoring malformed message: {}", e),
            }
        }));

        let subscribed = Arc::clone(&self.subscribed);
        Ok(Subscription::new(move || {
            drop(inner);
            subscribed.store(false, Ordering::Release);
        }))
    }
}

struct Listener {
    id: usize,
    context: PeerId,
    callback: MessageCallback,
}

#[derive(Default)]
struct Hub {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicUsize,
}

/// In-process medium for tests and single-process hosts.
///
/// Each handle is one context; `context()` joins another context to the same channel.
#[derive(Clone)]
pub struct InMemoryMedium {
    hub: Arc<Hub>,
    context: PeerId,
}

impl InMemoryMedium {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub::default()),
            context: PeerId::generate(),
        }
    }

    pub fn context(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
            context: PeerId::generate(),
        }
    }

    pub fn context_id(&self) -> PeerId {
        self.context
    }
}

impl Default for InMemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastMedium for InMemoryMedium {
    fn publish(&self, text: &str) -> Result<(), BusError> {
        let callbacks: Vec<_> = self
            .hub
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|l| l.context != self.context)
            .map(|l| Arc::clone(&l.callback))
            .collect();

        for callback in callbacks {
            callback(text.to_string());
        }
        Ok(())
    }
}

impl ObservableMedium for InMemoryMedium {
    fn subscribe(&self, callback: MessageCallback) -> Subscription {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.hub
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Listener {
                id,
                context: self.context,
                callback,
            });

        let hub = Arc::downgrade(&self.hub);
        Subscription::new(move || {
            if let Some(hub) = hub.upgrade() {
                if let Ok(mut guard) = hub.listeners.try_write() {
                    guard.retain(|l| l.id != id);
                }
            }
        })
    }
}
