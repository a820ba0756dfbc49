//! Synchronous named-channel event bus
//!
//! A graph publishes three channels: `get` (local interest in data it does
//! not have), `set` (a local write to broadcast) and `change` (any committed
//! write, local or merged). Delivery is synchronous and in registration
//! order. Listeners may register, unregister or call back into the graph
//! from inside a callback; dispatch works from a snapshot and re-checks
//! registration right before each call.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::lock;
use crate::record::Record;

/// Identifies a registered listener.
pub type ListenerId = Uuid;

/// Event channels published by a graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Get,
    Set,
    Change,
}

/// An event as delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphEvent {
    /// The local replica wants data at `path`
    Get { path: String },

    /// A locally originated write, to be broadcast to peers
    Set { path: String, record: Record },

    /// Any committed write at `path`, local or merged
    Change { path: String, record: Record },
}

impl GraphEvent {
    pub fn channel(&self) -> Channel {
        match self {
            GraphEvent::Get { .. } => Channel::Get,
            GraphEvent::Set { .. } => Channel::Set,
            GraphEvent::Change { .. } => Channel::Change,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            GraphEvent::Get { path } | GraphEvent::Set { path, .. } | GraphEvent::Change { path, .. } => path,
        }
    }

    /// The record carried by `set` and `change` events.
    pub fn record(&self) -> Option<&Record> {
        match self {
            GraphEvent::Get { .. } => None,
            GraphEvent::Set { record, .. } | GraphEvent::Change { record, .. } => Some(record),
        }
    }
}

type Callback = Arc<dyn Fn(&GraphEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    channel: Channel,
    once: bool,
    callback: Callback,
}

/// Registration-ordered listeners keyed by channel.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that stays until removed with [`EventBus::off`].
    pub fn on(&self, channel: Channel, callback: impl Fn(&GraphEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(channel, false, Arc::new(callback))
    }

    /// Register a listener that is removed right before its first call.
    pub fn once(&self, channel: Channel, callback: impl Fn(&GraphEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(channel, true, Arc::new(callback))
    }

    fn register(&self, channel: Channel, once: bool, callback: Callback) -> ListenerId {
        let id = Uuid::new_v4();
        lock(&self.listeners).push(Listener {
            id,
            channel,
            once,
            callback,
        });
        id
    }

    /// Remove a listener. Returns whether it was still registered; calling
    /// this again, or from inside the listener itself, is harmless.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn is_registered(&self, id: ListenerId) -> bool {
        lock(&self.listeners).iter().any(|l| l.id == id)
    }

    pub fn listener_count(&self, channel: Channel) -> usize {
        lock(&self.listeners)
            .iter()
            .filter(|l| l.channel == channel)
            .count()
    }

    /// Deliver `event` to every listener on its channel.
    pub fn emit(&self, event: &GraphEvent) {
        let channel = event.channel();
        let snapshot: Vec<(ListenerId, bool, Callback)> = lock(&self.listeners)
            .iter()
            .filter(|l| l.channel == channel)
            .map(|l| (l.id, l.once, Arc::clone(&l.callback)))
            .collect();

        for (id, once, callback) in snapshot {
            // A listener removed earlier in this dispatch is skipped; a once
            // listener is claimed by removing it.
            let live = if once { self.off(id) } else { self.is_registered(id) };
            if live {
                callback(event);
            }
        }
    }
}
