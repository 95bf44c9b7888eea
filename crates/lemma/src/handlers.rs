//! Event handler registry
//!
//! Maps event names to callbacks. The names double as the "hears" list sent
//! during registration, so a handler connected before `begin()` is
//! advertised to the host.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::protocol::EventValue;

/// Callback invoked with (event name, event value)
pub type Handler = Arc<dyn Fn(&str, &EventValue) + Send + Sync>;

#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler, replacing any previous one for the same name.
    /// Returns true when a handler was replaced.
    pub fn connect(&mut self, event_name: impl Into<String>, handler: Handler) -> bool {
        let event_name = event_name.into();
        let replaced = self.handlers.insert(event_name.clone(), handler).is_some();
        if replaced {
            warn!(event = %event_name, "Replacing event handler");
        }
        replaced
    }

    /// Invoke the handler for `event_name`. Events nobody listens for are
    /// dropped silently. Returns true when a handler ran.
    pub fn dispatch(&self, event_name: &str, value: &EventValue) -> bool {
        match self.handlers.get(event_name) {
            Some(handler) => {
                handler(event_name, value);
                true
            }
            None => {
                trace!(event = %event_name, "No handler for event");
                false
            }
        }
    }

    /// Sorted handler names, as advertised in registration
    pub fn names_snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
