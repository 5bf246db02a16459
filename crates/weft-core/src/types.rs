use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named values handed to agents, tools, and expressions.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use the caller's id when given, otherwise generate one.
    pub fn or_new(id: Option<String>) -> Self {
        id.map(Self).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a workflow run or agent execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters attached to an execution result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMetrics {
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    /// Tasks satisfied by a skip/continue policy or a false guard.
    pub tasks_skipped: usize,
    pub rounds: usize,
    pub iterations: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub elapsed_ms: u64,
}

/// Outcome of a workflow run or an agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub state: ExecutionState,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl ExecutionResult {
    pub fn completed(execution_id: impl Into<String>, result: Option<serde_json::Value>) -> Self {
        Self {
            execution_id: execution_id.into(),
            state: ExecutionState::Completed,
            result,
            error: None,
            metrics: ExecutionMetrics::default(),
            trace_id: None,
        }
    }

    pub fn failed(execution_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            state: ExecutionState::Failed,
            result: None,
            error: Some(error.into()),
            metrics: ExecutionMetrics::default(),
            trace_id: None,
        }
    }

    pub fn cancelled(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            state: ExecutionState::Cancelled,
            result: None,
            error: Some("Execution cancelled".to_string()),
            metrics: ExecutionMetrics::default(),
            trace_id: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn is_completed(&self) -> bool {
        self.state == ExecutionState::Completed
    }

    /// The result rendered as plain text (strings unquoted).
    pub fn result_text(&self) -> Option<String> {
        self.result.as_ref().map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Function part of a tool call request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Either a JSON object or a JSON-encoded string, depending on the backend.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A structured tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }

    /// Decode the arguments into a named-argument map.
    pub fn arguments(&self) -> crate::error::Result<Context> {
        match &self.function.arguments {
            serde_json::Value::Object(map) => Ok(map.clone()),
            serde_json::Value::Null => Ok(Context::new()),
            serde_json::Value::String(raw) if raw.trim().is_empty() => Ok(Context::new()),
            serde_json::Value::String(raw) => match serde_json::from_str(raw)? {
                serde_json::Value::Object(map) => Ok(map),
                other => Err(crate::error::WeftError::InvalidArguments(format!(
                    "expected an object, got {}",
                    other
                ))),
            },
            other => Err(crate::error::WeftError::InvalidArguments(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }
}

/// A chat message exchanged with the LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: vec![],
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Tool description advertised to the LLM for function calling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Function-calling shape: `{type: "function", function: {...}}`.
    pub fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A single generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub tools: Vec<ToolDefinition>,
}

/// A single generation response.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Record produced by one agent execution. Never an error: failures are
/// reported through `state` and `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub state: ExecutionState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub iterations: usize,
    #[serde(default)]
    pub usage: Usage,
}

impl AgentOutcome {
    pub fn completed(result: impl Into<String>, iterations: usize, usage: Usage) -> Self {
        Self {
            state: ExecutionState::Completed,
            result: Some(result.into()),
            error: None,
            iterations,
            usage,
        }
    }

    pub fn failed(error: impl Into<String>, iterations: usize, usage: Usage) -> Self {
        Self {
            state: ExecutionState::Failed,
            result: None,
            error: Some(error.into()),
            iterations,
            usage,
        }
    }

    pub fn cancelled(iterations: usize, usage: Usage) -> Self {
        Self {
            state: ExecutionState::Cancelled,
            result: None,
            error: Some("Execution cancelled".to_string()),
            iterations,
            usage,
        }
    }
}

/// Lifecycle event published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            target: None,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn targeted(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}
