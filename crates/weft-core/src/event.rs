use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::traits::{EventBus, EventHandler, SubscriptionId};
use crate::types::Event;

pub const EXECUTION_STARTED: &str = "execution.started";
pub const EXECUTION_COMPLETED: &str = "execution.completed";
pub const EXECUTION_FAILED: &str = "execution.failed";
pub const EXECUTION_CANCELLED: &str = "execution.cancelled";

/// Subscribes a handler to every event type.
pub const WILDCARD: &str = "*";

struct Subscription {
    id: SubscriptionId,
    event_type: String,
    handler: EventHandler,
}

/// In-process event bus.
///
/// Handlers are invoked concurrently on publish. A handler that errors or
/// panics is logged and does not affect delivery to the others. Every event
/// is also mirrored onto a tokio broadcast channel for stream consumers.
pub struct InMemoryEventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    /// Receive every published event.
    pub fn stream(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn handlers_for(&self, event_type: &str) -> Vec<EventHandler> {
        let subs = match self.subscriptions.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.iter()
            .filter(|s| s.event_type == event_type || s.event_type == WILDCARD)
            .map(|s| s.handler.clone())
            .collect()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

async fn deliver(handler: EventHandler, event: Event) {
    let event_type = event.event_type.clone();
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| (*handler)(event))) {
        Ok(fut) => fut,
        Err(_) => {
            warn!(event_type = %event_type, "Event handler panicked");
            return;
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(event_type = %event_type, error = %e, "Event handler failed"),
        Err(_) => warn!(event_type = %event_type, "Event handler panicked"),
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let handlers = self.handlers_for(&event.event_type);
            debug!(
                event_type = %event.event_type,
                handlers = handlers.len(),
                "Publishing event"
            );
            // Ignore error if no receivers
            let _ = self.tx.send(event.clone());
            join_all(handlers.into_iter().map(|h| deliver(h, event.clone()))).await;
            Ok(())
        })
    }

    fn subscribe(&self, event_type: &str, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = match self.subscriptions.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.push(Subscription {
            id,
            event_type: event_type.to_string(),
            handler,
        });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = match self.subscriptions.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }
}
