use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::expr::Expr;
use crate::types::Context;

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Agent,
    Tool,
    Condition,
    Loop,
    Parallel,
    HumanInLoop,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::HumanInLoop => "human_in_loop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds before the first retry.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    /// Upper bound on a single backoff, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl RetryConfig {
    /// Delays and base must be finite and non-negative.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (field, value) in [
            ("initial_delay", self.initial_delay),
            ("max_delay", self.max_delay),
            ("exponential_base", self.exponential_base),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!(
                    "retry {} must be a finite, non-negative number, got {}",
                    field, value
                ));
            }
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_delay() -> f64 { 1.0 }
fn default_max_delay() -> f64 { 60.0 }
fn default_exponential_base() -> f64 { 2.0 }
fn default_jitter() -> bool { true }
fn default_version() -> String { "1.0.0".to_string() }
fn default_workflow_id() -> String { "workflow".to_string() }
fn default_workflow_name() -> String { "Workflow".to_string() }

/// What to do when a task body fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Fail,
    Retry,
    Skip,
    Continue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub on_error: OnError,
    /// Task run in place of this one when it still fails.
    #[serde(default)]
    pub fallback_task: Option<String>,
    /// Free-form notification target, carried in failure events.
    #[serde(default)]
    pub error_notification: Option<String>,
}

/// Iteration settings for a loop task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// A literal array or a `$reference` that resolves to one.
    pub items: serde_json::Value,
    /// Task executed once per item.
    pub body: String,
    /// Run iterations concurrently.
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub tool_id: Option<String>,
    /// Literal values or `$task.key` / `$input` references.
    #[serde(default)]
    pub inputs: Context,
    /// Declared outputs. Advisory only.
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, rename = "loop", alias = "loop_config")]
    pub loop_config: Option<LoopConfig>,
    #[serde(default, alias = "retry_config")]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub error_handling: Option<ErrorHandling>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub metadata: Context,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            task_type,
            agent_id: None,
            tool_id: None,
            inputs: Context::new(),
            outputs: HashMap::new(),
            condition: None,
            loop_config: None,
            retry: None,
            error_handling: None,
            timeout_secs: None,
            metadata: Context::new(),
        }
    }

    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::new(id, TaskType::Agent)
        }
    }

    pub fn tool(id: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: Some(tool_id.into()),
            ..Self::new(id, TaskType::Tool)
        }
    }

    pub fn condition(id: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            condition: Some(expr.into()),
            ..Self::new(id, TaskType::Condition)
        }
    }

    pub fn looping(
        id: impl Into<String>,
        items: serde_json::Value,
        body: impl Into<String>,
    ) -> Self {
        Self {
            loop_config: Some(LoopConfig {
                items,
                body: body.into(),
                parallel: false,
            }),
            ..Self::new(id, TaskType::Loop)
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_guard(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.error_handling.get_or_insert_with(ErrorHandling::default).on_error = on_error;
        self
    }

    pub fn with_fallback(mut self, task_id: impl Into<String>) -> Self {
        self.error_handling
            .get_or_insert_with(ErrorHandling::default)
            .fallback_task = Some(task_id.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_parallel_loop(mut self) -> Self {
        if let Some(cfg) = self.loop_config.as_mut() {
            cfg.parallel = true;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_workflow_id")]
    pub id: String,
    #[serde(default = "default_workflow_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    /// Direct predecessors per task.
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
    #[serde(default, alias = "retry_config")]
    pub retry: RetryConfig,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Task whose result becomes the run's result.
    #[serde(default)]
    pub output_task: Option<String>,
    #[serde(default)]
    pub metadata: Context,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: String::new(),
            tasks: Vec::new(),
            dependencies: HashMap::new(),
            retry: RetryConfig::default(),
            error_handling: ErrorHandling::default(),
            output_task: None,
            metadata: Context::new(),
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_dependency(mut self, task_id: &str, depends_on: &[&str]) -> Self {
        self.dependencies
            .entry(task_id.to_string())
            .or_default()
            .extend(depends_on.iter().map(|d| d.to_string()));
        self
    }

    pub fn with_output_task(mut self, task_id: impl Into<String>) -> Self {
        self.output_task = Some(task_id.into());
        self
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Retry policy for a task, falling back to the workflow's.
    pub fn retry_for<'a>(&'a self, task: &'a TaskDefinition) -> &'a RetryConfig {
        task.retry.as_ref().unwrap_or(&self.retry)
    }

    /// Error policy for a task, falling back to the workflow's.
    pub fn error_handling_for<'a>(&'a self, task: &'a TaskDefinition) -> &'a ErrorHandling {
        task.error_handling.as_ref().unwrap_or(&self.error_handling)
    }

    /// Tasks that only run as a fallback or a loop body.
    pub fn detached_task_ids(&self) -> HashSet<String> {
        let mut detached = HashSet::new();
        if let Some(fb) = &self.error_handling.fallback_task {
            detached.insert(fb.clone());
        }
        for task in &self.tasks {
            if let Some(fb) = task.error_handling.as_ref().and_then(|e| e.fallback_task.as_ref()) {
                detached.insert(fb.clone());
            }
            if let Some(cfg) = &task.loop_config {
                detached.insert(cfg.body.clone());
            }
        }
        detached
    }

    /// Structural checks that do not need the dependency graph.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(WeftError::InvalidWorkflow("task with empty id".into()));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(WeftError::DuplicateTask(task.id.clone()));
            }
        }

        for (task, deps) in &self.dependencies {
            if !seen.contains(task.as_str()) {
                return Err(WeftError::UnknownTask(task.clone()));
            }
            for dep in deps {
                if !seen.contains(dep.as_str()) {
                    return Err(WeftError::UnknownDependency {
                        task: task.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let detached = self.detached_task_ids();
        for id in &detached {
            if !seen.contains(id.as_str()) {
                return Err(WeftError::UnknownTask(id.clone()));
            }
            let referenced = self.dependencies.contains_key(id)
                || self.dependencies.values().any(|deps| deps.contains(id));
            if referenced {
                return Err(WeftError::InvalidWorkflow(format!(
                    "task {} is a fallback or loop body and cannot take part in dependencies",
                    id
                )));
            }
        }

        if let Some(out) = &self.output_task {
            if !seen.contains(out.as_str()) {
                return Err(WeftError::UnknownTask(out.clone()));
            }
        }

        self.retry
            .validate()
            .map_err(|msg| WeftError::InvalidWorkflow(format!("workflow {}: {}", self.id, msg)))?;
        for task in &self.tasks {
            self.validate_task(task)?;
        }
        Ok(())
    }

    fn validate_task(&self, task: &TaskDefinition) -> Result<()> {
        let invalid = |msg: &str| {
            Err(WeftError::InvalidWorkflow(format!("task {}: {}", task.id, msg)))
        };
        if let Some(retry) = &task.retry {
            if let Err(msg) = retry.validate() {
                return invalid(&msg);
            }
        }
        match task.task_type {
            TaskType::Agent if task.agent_id.is_none() => return invalid("agent task requires agent_id"),
            TaskType::Tool if task.tool_id.is_none() => return invalid("tool task requires tool_id"),
            TaskType::Condition if task.condition.is_none() => {
                return invalid("condition task requires a condition")
            }
            TaskType::Loop => match &task.loop_config {
                None => return invalid("loop task requires a loop config"),
                Some(cfg) if cfg.body == task.id => return invalid("loop body cannot be the loop itself"),
                Some(cfg) => match &cfg.items {
                    serde_json::Value::Array(_) => {}
                    serde_json::Value::String(s) if s.starts_with('$') => {}
                    _ => return invalid("loop items must be an array or a $reference"),
                },
            },
            _ => {}
        }
        if let Some(expr) = &task.condition {
            Expr::parse(expr).map_err(|e| {
                WeftError::InvalidWorkflow(format!("task {}: {}", task.id, e))
            })?;
        }
        Ok(())
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| WeftError::Parse(e.to_string()))
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| WeftError::Parse(e.to_string()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| WeftError::Parse(e.to_string()))
    }

    /// Load by file extension: `.json`, `.yaml`/`.yml`, or `.toml`.
    pub fn from_path(path: &Path) -> Result<Self> {
        load_document(path, Self::from_json_str, Self::from_yaml_str, Self::from_toml_str)
    }
}

fn load_document<T>(
    path: &Path,
    json: fn(&str) -> Result<T>,
    yaml: fn(&str) -> Result<T>,
    toml: fn(&str) -> Result<T>,
) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => json(&content),
        Some("yaml") | Some("yml") => yaml(&content),
        Some("toml") => toml(&content),
        other => Err(WeftError::Parse(format!(
            "unsupported definition format {:?} for {}",
            other.unwrap_or(""),
            path.display()
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_short_term_enabled")]
    pub short_term_enabled: bool,
    /// Interactions kept by short-term memory.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_enabled: default_short_term_enabled(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_short_term_enabled() -> bool { true }
fn default_max_entries() -> usize { 20 }
fn default_model() -> String { "gpt-4".to_string() }
fn default_max_iterations() -> usize { 10 }
fn default_temperature() -> f32 { 0.7 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Tool ids this agent may call.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, alias = "memory_config")]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub metadata: Context,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            model: default_model(),
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            max_iterations: default_max_iterations(),
            temperature: default_temperature(),
            memory: MemoryConfig::default(),
            metadata: Context::new(),
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| WeftError::Parse(e.to_string()))
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| WeftError::Parse(e.to_string()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| WeftError::Parse(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        load_document(path, Self::from_json_str, Self::from_yaml_str, Self::from_toml_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const YAML: &str = r#"
id: research
name: Research pipeline
tasks:
  - id: fetch
    type: tool
    tool_id: json_parse
    inputs:
      text: $raw
  - id: check
    type: condition
    condition: "results.fetch.count > 0"
  - id: summarize
    type: agent
    agent_id: writer
    inputs:
      task: "Summarize $fetch.title"
    error_handling:
      on_error: retry
      fallback_task: backup
    retry:
      max_retries: 2
  - id: backup
    type: agent
    agent_id: writer
dependencies:
  check: [fetch]
  summarize: [check]
output_task: summarize
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let wf = WorkflowDefinition::from_yaml_str(YAML).unwrap();
        assert_eq!(wf.version, "1.0.0");
        assert_eq!(wf.tasks.len(), 4);
        assert_eq!(wf.tasks[0].task_type, TaskType::Tool);
        assert_eq!(wf.tasks[0].inputs["text"], json!("$raw"));

        let summarize = wf.task("summarize").unwrap();
        assert_eq!(wf.retry_for(summarize).max_retries, 2);
        assert_eq!(wf.retry_for(summarize).initial_delay, 1.0);
        assert_eq!(wf.error_handling_for(summarize).on_error, OnError::Retry);

        let fetch = wf.task("fetch").unwrap();
        assert_eq!(wf.retry_for(fetch).max_retries, 3);
        assert_eq!(wf.error_handling_for(fetch).on_error, OnError::Fail);

        assert!(wf.detached_task_ids().contains("backup"));
        wf.validate().unwrap();
    }

    #[test]
    fn parses_json_and_toml() {
        let json = r#"{"id":"w","tasks":[{"id":"a","type":"human_in_loop"}]}"#;
        let wf = WorkflowDefinition::from_json_str(json).unwrap();
        assert_eq!(wf.name, "Workflow");
        assert_eq!(wf.tasks[0].task_type, TaskType::HumanInLoop);

        let toml = r#"
id = "w"
[[tasks]]
id = "a"
type = "loop"
[tasks.loop]
items = [1, 2]
body = "b"
[[tasks]]
id = "b"
type = "tool"
tool_id = "calculator"
"#;
        let wf = WorkflowDefinition::from_toml_str(toml).unwrap();
        let cfg = wf.tasks[0].loop_config.as_ref().unwrap();
        assert_eq!(cfg.body, "b");
        assert!(!cfg.parallel);
        wf.validate().unwrap();
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let wf = WorkflowDefinition::new("w", "w")
            .with_task(TaskDefinition::tool("a", "t"))
            .with_dependency("a", &["ghost"]);
        let err = wf.validate().unwrap_err();
        assert!(matches!(err, WeftError::UnknownDependency { .. }));
    }

    #[test]
    fn validate_rejects_unusable_retry_delays() {
        let huge_but_finite = RetryConfig {
            initial_delay: 1e20,
            max_delay: 1e20,
            ..Default::default()
        };
        let wf = WorkflowDefinition::new("w", "w")
            .with_task(TaskDefinition::tool("a", "t").with_retry(huge_but_finite));
        assert!(wf.validate().is_ok());

        let wf = WorkflowDefinition::new("w", "w").with_task(
            TaskDefinition::tool("a", "t").with_retry(RetryConfig {
                max_delay: f64::INFINITY,
                ..Default::default()
            }),
        );
        let err = wf.validate().unwrap_err();
        assert!(matches!(err, WeftError::InvalidWorkflow(ref m) if m.contains("task a") && m.contains("max_delay")));

        let mut wf = WorkflowDefinition::new("w", "w").with_task(TaskDefinition::tool("a", "t"));
        wf.retry.initial_delay = -1.0;
        assert!(matches!(wf.validate(), Err(WeftError::InvalidWorkflow(_))));

        wf.retry.initial_delay = 1.0;
        wf.retry.exponential_base = f64::NAN;
        assert!(matches!(wf.validate(), Err(WeftError::InvalidWorkflow(_))));
    }

    #[test]
    fn validate_rejects_duplicates_and_missing_fields() {
        let wf = WorkflowDefinition::new("w", "w")
            .with_task(TaskDefinition::tool("a", "t"))
            .with_task(TaskDefinition::tool("a", "t"));
        assert!(matches!(wf.validate(), Err(WeftError::DuplicateTask(_))));

        let wf = WorkflowDefinition::new("w", "w").with_task(TaskDefinition::new("a", TaskType::Agent));
        assert!(matches!(wf.validate(), Err(WeftError::InvalidWorkflow(_))));
    }

    #[test]
    fn validate_rejects_unsafe_condition() {
        let wf = WorkflowDefinition::new("w", "w")
            .with_task(TaskDefinition::condition("c", "__import__('os')"));
        assert!(wf.validate().is_err());
    }

    #[test]
    fn validate_rejects_scheduled_fallback() {
        let wf = WorkflowDefinition::new("w", "w")
            .with_task(TaskDefinition::tool("a", "t").with_fallback("b"))
            .with_task(TaskDefinition::tool("b", "t"))
            .with_dependency("b", &["a"]);
        assert!(matches!(wf.validate(), Err(WeftError::InvalidWorkflow(_))));
    }

    #[test]
    fn agent_definition_defaults() {
        let def = AgentDefinition::from_json_str(r#"{"id":"writer","system_prompt":"Write."}"#).unwrap();
        assert_eq!(def.model, "gpt-4");
        assert_eq!(def.max_iterations, 10);
        assert!((def.temperature - 0.7).abs() < f32::EPSILON);
        assert!(def.memory.short_term_enabled);
    }

    #[test]
    fn from_path_selects_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yml");
        std::fs::write(&path, YAML).unwrap();
        let wf = WorkflowDefinition::from_path(&path).unwrap();
        assert_eq!(wf.id, "research");

        let bad = dir.path().join("wf.txt");
        std::fs::write(&bad, YAML).unwrap();
        assert!(matches!(WorkflowDefinition::from_path(&bad), Err(WeftError::Parse(_))));
    }
}
