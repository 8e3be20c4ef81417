//! Routes inbound pushes to their entry and fans them out.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use templink_core::{CacheError, TemplateValue};

use crate::connection::{Push, PushPayload};
use crate::registry::{lock, SharedRegistry};

/// What happened to a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Applied to an entry and handed to this many callbacks.
    Delivered { subscribers: usize },
    /// No entry owns the correlation id (late message after teardown).
    Orphaned,
}

/// Reads pushes and applies them to the shared registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: SharedRegistry,
}

impl Dispatcher {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    /// Apply one push: update the owning entry's value and invoke every
    /// callback registered at that moment. Orphans are dropped.
    pub fn dispatch(&self, push: Push) -> DispatchOutcome {
        let value = match push.payload {
            PushPayload::Rendered(result) => TemplateValue::Rendered(result),
            PushPayload::RenderError(message) => {
                TemplateValue::Failed(CacheError::malformed_template(message))
            }
        };

        let callbacks = {
            let mut registry = lock(&self.registry);
            let key = match registry.resolve(push.correlation) {
                Some(key) => key.clone(),
                None => {
                    registry.counters_mut().orphaned_pushes += 1;
                    trace!(correlation = %push.correlation, "Dropping orphaned push");
                    return DispatchOutcome::Orphaned;
                }
            };
            let callbacks = match registry.get_mut(&key) {
                Some(entry) => {
                    entry.set_value(value.clone());
                    entry.callbacks()
                }
                None => {
                    registry.counters_mut().orphaned_pushes += 1;
                    return DispatchOutcome::Orphaned;
                }
            };
            registry.counters_mut().pushes_delivered += 1;
            debug!(
                key = %key.digest(),
                correlation = %push.correlation,
                subscribers = callbacks.len(),
                failed = value.is_failure(),
                "Push delivered"
            );
            callbacks
        };

        for callback in &callbacks {
            callback(&value);
        }
        DispatchOutcome::Delivered {
            subscribers: callbacks.len(),
        }
    }

    /// Drain a push channel until every sender is gone.
    pub async fn run(self, mut pushes: mpsc::Receiver<Push>) {
        while let Some(push) = pushes.recv().await {
            self.dispatch(push);
        }
        debug!("Push channel closed, dispatcher stopping");
    }
}
