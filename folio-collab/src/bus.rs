//! Typed publish/subscribe keyed by [`EventKind`].
//!
//! Handlers run synchronously on the publishing task. The handler list is
//! snapshotted before dispatch, so a handler registered while an event is being
//! published (or afterwards) never sees that event. Nothing is buffered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::events::{EventKind, SessionEvent};

/// Shared event handler.
pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
}

/// Per-session event bus. Never global.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered for `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = registry.handlers.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    /// Deliver `event` to the handlers currently registered for its kind.
    /// Returns the number of handlers invoked.
    pub fn publish(&self, event: &SessionEvent) -> usize {
        let snapshot: Vec<EventHandler> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry
                .handlers
                .get(&event.kind())
                .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.handlers.get(&kind).map_or(0, Vec::len)
    }
}
