//! Subscriber registry behind `on`/`off`.
//!
//! Handlers run synchronously on the manager's event loop, in registration
//! order, in the turn the event is processed. They receive shared references
//! and must not block.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::constants::WILDCARD_EVENT;
use crate::core::{InboundEvent, LinkError};

/// Callback for inbound events.
pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Callback for errors surfaced on the error channel.
pub type ErrorHandler = Arc<dyn Fn(&LinkError) + Send + Sync>;

/// Token returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

/// Event type to ordered handler list, plus the error channel.
#[derive(Default)]
pub struct HandlerRegistry {
    events: HashMap<String, Vec<(HandlerId, EventHandler)>>,
    errors: Vec<(HandlerId, ErrorHandler)>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .events
            .iter()
            .map(|(event_type, handlers)| (event_type.as_str(), handlers.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("events", &counts)
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type` (`"*"` matches every type).
    pub fn on(&mut self, id: HandlerId, event_type: impl Into<String>, handler: EventHandler) {
        self.events
            .entry(event_type.into())
            .or_default()
            .push((id, handler));
    }

    /// Remove the handler registered under `id` for `event_type`.
    pub fn off(&mut self, event_type: &str, id: HandlerId) -> bool {
        let Some(handlers) = self.events.get_mut(event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.events.remove(event_type);
        }
        removed
    }

    /// Register an error handler.
    pub fn on_error(&mut self, id: HandlerId, handler: ErrorHandler) {
        self.errors.push((id, handler));
    }

    /// Remove an error handler.
    pub fn off_error(&mut self, id: HandlerId) -> bool {
        let before = self.errors.len();
        self.errors.retain(|(handler_id, _)| *handler_id != id);
        self.errors.len() != before
    }

    /// Invoke every handler for the event's type, then the wildcard handlers.
    ///
    /// Returns how many handlers ran.
    pub fn dispatch(&self, event: &InboundEvent) -> usize {
        let exact = self.events.get(&event.event_type).into_iter().flatten();
        let wildcard = (event.event_type != WILDCARD_EVENT)
            .then(|| self.events.get(WILDCARD_EVENT))
            .flatten()
            .into_iter()
            .flatten();

        let mut ran = 0;
        for (_, handler) in exact.chain(wildcard) {
            handler(event);
            ran += 1;
        }
        ran
    }

    /// Invoke every error handler.
    pub fn report(&self, error: &LinkError) {
        for (_, handler) in &self.errors {
            handler(error);
        }
    }

    /// Number of event handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.events.get(event_type).map_or(0, Vec::len)
    }
}
