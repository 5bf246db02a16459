use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// LLM backend — one generation per call.
pub trait LlmBackend: Send + Sync + 'static {
    /// Generate a completion, optionally with structured tool calls.
    fn generate(&self, request: LlmRequest) -> BoxFuture<'_, Result<LlmResponse>>;
}

/// Tool — a named callable with a JSON-Schema description.
pub trait Tool: Send + Sync + 'static {
    /// Registry key.
    fn id(&self) -> &str;

    /// Name advertised to the LLM. Defaults to the id.
    fn name(&self) -> &str {
        self.id()
    }

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the named arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute with named arguments.
    fn execute(&self, args: Context) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for one call.
    fn timeout_secs(&self) -> u64 {
        30
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }

    /// Function-calling description for the LLM.
    fn schema(&self) -> serde_json::Value {
        self.definition().schema()
    }
}

/// String-keyed JSON state store.
pub trait StateStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Returns true if the key existed.
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool>>;

    fn exists(&self, key: &str) -> BoxFuture<'_, Result<bool>>;

    /// Add `by` to an integer value (missing keys start at 0) and return the new value.
    fn increment(&self, key: &str, by: i64) -> BoxFuture<'_, Result<i64>>;
}

/// Callback invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Opaque subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Publish/subscribe event transport.
pub trait EventBus: Send + Sync + 'static {
    /// Deliver to every handler subscribed to the event type (and to `*`).
    /// Handler failures are logged, never returned.
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>>;

    fn subscribe(&self, event_type: &str, handler: EventHandler) -> SubscriptionId;

    /// Returns true if the subscription existed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Prior-context provider consulted by agents.
pub trait MemoryProvider: Send + Sync + 'static {
    fn retrieve_relevant<'a>(
        &'a self,
        task: &'a str,
        context: &'a Context,
    ) -> BoxFuture<'a, Result<Option<String>>>;

    fn store_interaction<'a>(
        &'a self,
        task: &'a str,
        response: &'a str,
        context: &'a Context,
    ) -> BoxFuture<'a, Result<()>>;
}
