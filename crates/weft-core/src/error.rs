use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Definition errors
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    // Task-body errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Agent {0} not found")]
    AgentNotFound(String),

    #[error("Agent {agent} failed: {message}")]
    AgentFailed { agent: String, message: String },

    #[error("Agent exceeded max iterations ({0})")]
    MaxIterationsExceeded(usize),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("Task {task} timed out after {timeout_secs}s")]
    TaskTimeout { task: String, timeout_secs: u64 },

    #[error("Loop {task} failed at iteration {index}: {message}")]
    LoopIteration {
        task: String,
        index: usize,
        message: String,
    },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Resource-protection errors
    #[error("Circuit breaker is open: {name}")]
    CircuitOpen { name: String },

    #[error("Rate limit exceeded for {key}")]
    RateLimited { key: String },

    // Infrastructure errors
    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Circuit-open and rate-limit rejections are expected protection
    /// signals, not faults of the guarded call.
    pub fn is_resource_protection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateLimited { .. })
    }

    /// Errors in the workflow definition itself.
    pub fn is_definition(&self) -> bool {
        matches!(
            self,
            Self::InvalidWorkflow(_)
                | Self::DuplicateTask(_)
                | Self::UnknownDependency { .. }
                | Self::UnknownTask(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
