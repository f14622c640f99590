//! Observer registry with per-handler failure isolation.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, trace};

use crate::events::ConnectionEvent;

/// Observer of session events.
///
/// A handler that returns an error or panics is logged and skipped; the
/// remaining handlers still see the event.
pub trait ConnectionHandler: Send + Sync {
    /// React to a session event.
    fn handle(&self, event: &ConnectionEvent) -> anyhow::Result<()>;
}

impl<F> ConnectionHandler for F
where
    F: Fn(&ConnectionEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &ConnectionEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Unordered set of handlers, keyed by `Arc` identity.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn ConnectionHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns `false` if this exact handler is already present.
    pub fn add(&self, handler: Arc<dyn ConnectionHandler>) -> bool {
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Unregister a handler. Returns `false` if it was not registered.
    pub fn remove(&self, handler: &Arc<dyn ConnectionHandler>) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        handlers.len() != before
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver `event` to every handler registered at the time of the call.
    ///
    /// Returns the number of handlers that failed.
    pub fn notify(&self, event: &ConnectionEvent) -> usize {
        // Snapshot so handlers can add or remove handlers while being called.
        let snapshot: Vec<Arc<dyn ConnectionHandler>> = self.handlers.read().clone();
        trace!(kind = event.kind(), handlers = snapshot.len(), "notifying handlers");

        let mut failures = 0;
        for handler in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(kind = event.kind(), error = %e, "session handler failed");
                }
                Err(payload) => {
                    failures += 1;
                    error!(
                        kind = event.kind(),
                        panic = panic_message(payload.as_ref()),
                        "session handler panicked"
                    );
                }
            }
        }
        failures
    }
}

fn same_handler(a: &Arc<dyn ConnectionHandler>, b: &Arc<dyn ConnectionHandler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
