use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::traits::Tool;
use weft_core::types::{Context, ToolDefinition};

/// Registry of available tools, keyed by tool id.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool, e.g. one the caller keeps a handle to.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let id = tool.id().to_string();
        if self.tools.insert(id.clone(), tool).is_some() {
            debug!(tool = %id, "Replaced registered tool");
        }
    }

    /// Unregister a tool by id.
    pub fn unregister(&mut self, id: &str) -> bool {
        self.tools.remove(id).is_some()
    }

    /// Get a tool by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    /// List registered tool ids, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get tool definitions for sending to the LLM, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Find a tool by the name the LLM was shown.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.get(name)
            .or_else(|| self.tools.values().find(|t| t.name() == name).cloned())
    }

    /// A registry holding only the listed tools. Unknown ids are skipped.
    pub fn subset(&self, ids: &[String]) -> Self {
        let mut out = Self::new();
        for id in ids {
            match self.tools.get(id) {
                Some(tool) => {
                    out.tools.insert(id.clone(), tool.clone());
                }
                None => warn!(tool = %id, "Tool not registered, skipping"),
            }
        }
        out
    }

    /// Execute a tool by id under its timeout.
    pub async fn execute(&self, id: &str, args: Context) -> Result<serde_json::Value> {
        let tool = self
            .find_by_name(id)
            .ok_or_else(|| WeftError::ToolNotFound(id.to_string()))?;

        let timeout_secs = tool.timeout_secs();
        let timeout = std::time::Duration::from_secs(timeout_secs);

        match tokio::time::timeout(timeout, tool.execute(args)).await {
            Ok(result) => result,
            Err(_) => Err(WeftError::ToolTimeout {
                tool: id.to_string(),
                timeout_secs,
            }),
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::calculator::CalculatorTool);
        registry.register(crate::builtin::json_parse::JsonParseTool);
        registry.register(crate::builtin::file_read::FileReadTool);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_test_utils::{ctx, SlowTool, StaticTool};

    #[test]
    fn builtins_are_registered() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["calculator", "file_read", "json_parse"]);
        let defs = registry.definitions();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].name, "calculator");
    }

    #[tokio::test]
    async fn execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", Context::new()).await.unwrap_err();
        assert!(matches!(err, WeftError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn execute_passes_named_arguments() {
        let tool = Arc::new(StaticTool::new("echo", serde_json::json!({"x": 5})));
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());

        let out = registry
            .execute("echo", ctx(serde_json::json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(out["x"], 5);
        assert_eq!(tool.calls()[0]["a"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(
            SlowTool::new("slow", Duration::from_secs(10), serde_json::json!(1)).with_timeout_secs(1),
        );
        let err = registry.execute("slow", Context::new()).await.unwrap_err();
        assert!(matches!(err, WeftError::ToolTimeout { timeout_secs: 1, .. }));
    }

    #[test]
    fn subset_keeps_only_known_ids() {
        let registry = ToolRegistry::with_builtins();
        let sub = registry.subset(&["calculator".to_string(), "missing".to_string()]);
        assert_eq!(sub.list(), vec!["calculator"]);
    }
}
