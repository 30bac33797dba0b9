//! In-process routing of decoded integration events to local handlers.
//!
//! Handlers are registered per [`EventKind`] and run synchronously in
//! registration order. The first failing handler stops the chain; the caller
//! (a broker listener) turns that into a negative acknowledgement so the
//! broker redelivers the message. Because of that redelivery every handler
//! must be idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::integration::{EventKind, IntegrationEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Retrying later may succeed (store unavailable, lock poisoned, ...).
    #[error("transient failure: {0}")]
    Transient(String),
    /// The event cannot be applied as-is; retried until dead-lettered.
    #[error("event rejected: {0}")]
    Rejected(String),
}

/// A local reaction to one or more integration event kinds.
pub trait EventHandler: Send + Sync {
    /// Short stable name used in logs.
    fn name(&self) -> &'static str;

    fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError>;
}

/// Which handler failed, and how.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler `{handler}` failed on {kind}: {error}")]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub kind: EventKind,
    pub error: HandlerError,
}

#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl core::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (kind, handlers) in &self.handlers {
            let names: Vec<&'static str> = handlers.iter().map(|h| h.name()).collect();
            map.entry(kind, &names);
        }
        map.finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Run every handler registered for the event's kind, in order.
    ///
    /// Returns how many handlers ran. An event nobody handles is fine (0).
    pub fn dispatch(&self, event: &IntegrationEvent) -> Result<usize, HandlerFailure> {
        let kind = event.kind();
        let Some(handlers) = self.handlers.get(&kind) else {
            return Ok(0);
        };

        for handler in handlers {
            handler.handle(event).map_err(|error| HandlerFailure {
                handler: handler.name(),
                kind,
                error,
            })?;
        }

        Ok(handlers.len())
    }
}
