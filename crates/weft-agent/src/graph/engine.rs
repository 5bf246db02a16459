use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::expr::evaluate_bool;
use weft_core::types::*;
use weft_core::workflow::{OnError, TaskDefinition, TaskType, WorkflowDefinition};
use weft_tools::ToolRegistry;

use super::dependency::DependencyGraph;
use super::input::{resolve_inputs, resolve_value, ResolvedInputs, Scope};
use super::retry::calculate_backoff;
use crate::orchestrator::Orchestrator;

/// Loops whose bodies are loops may nest this deep.
const MAX_LOOP_DEPTH: usize = 8;

/// External approval step for `human_in_loop` tasks.
pub trait HumanInLoopHook: Send + Sync + 'static {
    /// Hand the task to a person. The returned value becomes the task's
    /// result.
    fn request<'a>(&'a self, task_id: &'a str, inputs: &'a Context) -> BoxFuture<'a, Result<Value>>;
}

/// Outcome of one task after its error policy has been applied.
#[derive(Debug)]
enum TaskOutcome {
    Completed(Value),
    /// Satisfies downstream readiness with a placeholder value.
    Skipped(Value),
    Failed(String),
    /// The run's token fired. Error policies never absorb this.
    Cancelled,
}

/// Agent usage summed across a run. Written from concurrent task bodies.
#[derive(Default)]
struct Tally {
    iterations: AtomicUsize,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl Tally {
    fn record(&self, metrics: &ExecutionMetrics) {
        self.iterations.fetch_add(metrics.iterations, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(metrics.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(metrics.completion_tokens, Ordering::Relaxed);
    }

    fn apply(&self, metrics: &mut ExecutionMetrics) {
        metrics.iterations = self.iterations.load(Ordering::Relaxed);
        metrics.prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        metrics.completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
    }
}

/// Drives one workflow definition to completion, round by round.
///
/// Each round dispatches every ready task concurrently and waits for the
/// whole batch before the completed and failed sets are updated. A round
/// with nothing ready and nothing failed means the graph is stuck.
pub struct WorkflowEngine {
    definition: WorkflowDefinition,
    graph: DependencyGraph,
    task_ids: HashSet<String>,
    orchestrator: Arc<Orchestrator>,
    tools: ToolRegistry,
    config: EngineConfig,
    human: Option<Arc<dyn HumanInLoopHook>>,
}

impl WorkflowEngine {
    /// Validate the definition and build its dependency graph.
    pub fn new(
        definition: WorkflowDefinition,
        orchestrator: Arc<Orchestrator>,
        tools: ToolRegistry,
    ) -> Result<Self> {
        definition.validate()?;
        let graph = DependencyGraph::from_workflow(&definition)?;
        let task_ids = definition.tasks.iter().map(|t| t.id.clone()).collect();
        Ok(Self {
            definition,
            graph,
            task_ids,
            orchestrator,
            tools,
            config: EngineConfig::default(),
            human: None,
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_human_hook(mut self, hook: Arc<dyn HumanInLoopHook>) -> Self {
        self.human = Some(hook);
        self
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Readiness rounds assuming every task succeeds.
    pub fn plan(&self) -> Result<Vec<Vec<String>>> {
        self.graph.plan()
    }

    pub async fn execute(&self, inputs: Context, execution_id: Option<String>) -> ExecutionResult {
        self.execute_with_cancel(inputs, execution_id, CancellationToken::new())
            .await
    }

    /// Run the workflow. The run is registered with the orchestrator, so
    /// `Orchestrator::cancel_execution(execution_id)` stops it between
    /// rounds and interrupts in-flight task bodies.
    pub async fn execute_with_cancel(
        &self,
        inputs: Context,
        execution_id: Option<String>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let execution_id = ExecutionId::or_new(execution_id).to_string();
        let trace_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "workflow",
            workflow_id = %self.definition.id,
            execution_id = %execution_id,
            trace_id = %trace_id,
        );
        let _active = self
            .orchestrator
            .register_cancellation(&execution_id, cancel.clone());

        self.drive(&inputs, &execution_id, &cancel)
            .instrument(span)
            .await
            .with_trace_id(trace_id)
    }

    async fn drive(
        &self,
        inputs: &Context,
        execution_id: &str,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let start = Instant::now();
        let tally = Tally::default();
        let mut metrics = ExecutionMetrics::default();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, Value> = HashMap::new();
        let mut errors: BTreeMap<String, String> = BTreeMap::new();
        let mut last_completed: Option<String> = None;
        let mut interrupted = false;

        info!(tasks = self.graph.len(), "Workflow started");

        while completed.len() + failed.len() < self.graph.len() {
            if cancel.is_cancelled() {
                return self.cancelled(execution_id, metrics, &tally, start);
            }

            let ready: Vec<String> = self
                .graph
                .ready_tasks(&completed)
                .into_iter()
                .filter(|id| !failed.contains(id))
                .collect();

            if ready.is_empty() {
                if failed.is_empty() {
                    let pending: Vec<&str> = self
                        .graph
                        .task_ids()
                        .iter()
                        .filter(|id| !completed.contains(*id))
                        .map(String::as_str)
                        .collect();
                    error!(pending = ?pending, "Workflow stuck");
                    return ExecutionResult::failed(
                        execution_id,
                        format!(
                            "Workflow stuck: circular or missing dependency among {}",
                            pending.join(", ")
                        ),
                    )
                    .with_metrics(finish_metrics(metrics, &tally, start));
                }
                break;
            }

            metrics.rounds += 1;
            debug!(round = metrics.rounds, tasks = ?ready, "Dispatching round");

            let outcomes = {
                let scope = Scope {
                    inputs,
                    results: &results,
                    task_ids: &self.task_ids,
                };
                let batch = ready
                    .iter()
                    .map(|id| self.run_scheduled(id, scope, &tally, cancel));
                join_all(batch).await
            };

            for (task_id, outcome) in ready.into_iter().zip(outcomes) {
                match outcome {
                    TaskOutcome::Completed(value) => {
                        results.insert(task_id.clone(), value);
                        metrics.tasks_completed += 1;
                        completed.insert(task_id.clone());
                        last_completed = Some(task_id);
                    }
                    TaskOutcome::Skipped(value) => {
                        results.insert(task_id.clone(), value);
                        metrics.tasks_skipped += 1;
                        completed.insert(task_id);
                    }
                    TaskOutcome::Failed(message) => {
                        warn!(
                            task_id = %task_id,
                            error = %message,
                            blocked = ?self.graph.downstream_of(&task_id),
                            "Task failed"
                        );
                        metrics.tasks_failed += 1;
                        errors.insert(task_id.clone(), message);
                        failed.insert(task_id);
                    }
                    TaskOutcome::Cancelled => {
                        debug!(task_id = %task_id, "Task interrupted by cancellation");
                        interrupted = true;
                        failed.insert(task_id);
                    }
                }
            }
        }

        if interrupted || (cancel.is_cancelled() && !failed.is_empty()) {
            return self.cancelled(execution_id, metrics, &tally, start);
        }

        let result = match &self.definition.output_task {
            Some(id) => results.get(id).cloned(),
            None => last_completed.and_then(|id| results.get(&id).cloned()),
        };
        let metrics = finish_metrics(metrics, &tally, start);

        info!(
            completed = metrics.tasks_completed,
            failed = metrics.tasks_failed,
            skipped = metrics.tasks_skipped,
            rounds = metrics.rounds,
            elapsed_ms = metrics.elapsed_ms,
            "Workflow finished"
        );

        if errors.is_empty() {
            ExecutionResult::completed(execution_id, result).with_metrics(metrics)
        } else {
            let detail: Vec<String> = errors
                .iter()
                .map(|(id, e)| format!("{} ({})", id, e))
                .collect();
            ExecutionResult::failed(execution_id, format!("Tasks failed: {}", detail.join("; ")))
                .with_metrics(metrics)
        }
    }

    fn cancelled(
        &self,
        execution_id: &str,
        metrics: ExecutionMetrics,
        tally: &Tally,
        start: Instant,
    ) -> ExecutionResult {
        info!("Workflow cancelled");
        ExecutionResult::cancelled(execution_id).with_metrics(finish_metrics(metrics, tally, start))
    }

    async fn run_scheduled(
        &self,
        task_id: &str,
        scope: Scope<'_>,
        tally: &Tally,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        match self.definition.task(task_id) {
            Some(task) => self.run_task(task, None, scope, tally, cancel, 0).await,
            None => TaskOutcome::Failed(WeftError::UnknownTask(task_id.to_string()).to_string()),
        }
    }

    /// Run a task under its guard, retry, fallback, and error policy.
    fn run_task<'a>(
        &'a self,
        task: &'a TaskDefinition,
        base: Option<&'a Context>,
        scope: Scope<'a>,
        tally: &'a Tally,
        cancel: &'a CancellationToken,
        depth: usize,
    ) -> BoxFuture<'a, TaskOutcome> {
        Box::pin(async move {
            if task.task_type != TaskType::Condition {
                if let Some(guard) = &task.condition {
                    let args = self.task_args(task, base, scope);
                    match evaluate_bool(guard, &expression_scope(&args.values, scope.results)) {
                        Ok(true) => {}
                        Ok(false) => {
                            info!(task_id = %task.id, guard = %guard, "Guard is false, skipping task");
                            return TaskOutcome::Skipped(Value::Null);
                        }
                        Err(e) => return TaskOutcome::Failed(e.to_string()),
                    }
                }
            }

            let policy = self.definition.error_handling_for(task);
            let retry = self.definition.retry_for(task);
            let attempts = match policy.on_error {
                OnError::Retry => retry.max_retries.saturating_add(1),
                _ => 1,
            };

            let mut last_error = None;
            for attempt in 0..attempts {
                let started = Instant::now();
                match self.attempt(task, base, scope, tally, cancel, depth).await {
                    Ok(value) => {
                        debug!(
                            task_id = %task.id,
                            attempt = attempt + 1,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Task completed"
                        );
                        return TaskOutcome::Completed(value);
                    }
                    Err(WeftError::Cancelled) if cancel.is_cancelled() => {
                        return TaskOutcome::Cancelled;
                    }
                    Err(e) => {
                        if attempt + 1 < attempts {
                            let delay = calculate_backoff(retry, attempt);
                            warn!(
                                task_id = %task.id,
                                attempt = attempt + 1,
                                backoff_ms = delay.as_millis() as u64,
                                error = %e,
                                "Task failed, retrying"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => return TaskOutcome::Cancelled,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        last_error = Some(e);
                    }
                }
            }
            let message = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Task failed".to_string());
            if cancel.is_cancelled() {
                return TaskOutcome::Cancelled;
            }

            if let Some(fallback_id) = &policy.fallback_task {
                if let Some(fallback) = self.definition.task(fallback_id) {
                    info!(task_id = %task.id, fallback = %fallback_id, "Running fallback task");
                    let args = self.task_args(task, base, scope).values;
                    match self
                        .attempt(fallback, Some(&args), scope, tally, cancel, depth)
                        .await
                    {
                        Ok(value) => return TaskOutcome::Completed(value),
                        Err(e) => {
                            warn!(task_id = %task.id, fallback = %fallback_id, error = %e, "Fallback task failed")
                        }
                    }
                }
            }

            if cancel.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            match policy.on_error {
                OnError::Skip => {
                    warn!(task_id = %task.id, error = %message, "Task failed, skipping");
                    TaskOutcome::Skipped(Value::Null)
                }
                OnError::Continue => {
                    warn!(task_id = %task.id, error = %message, "Task failed, continuing");
                    TaskOutcome::Skipped(json!({"error": message, "skipped": true}))
                }
                OnError::Fail | OnError::Retry => TaskOutcome::Failed(message),
            }
        })
    }

    /// One dispatch of a task body under its deadline and the run's
    /// cancellation token.
    async fn attempt(
        &self,
        task: &TaskDefinition,
        base: Option<&Context>,
        scope: Scope<'_>,
        tally: &Tally,
        cancel: &CancellationToken,
        depth: usize,
    ) -> Result<Value> {
        let args = self.task_args(task, base, scope);
        let body = self.dispatch(task, args, scope, tally, cancel, depth);
        let timeout_secs = task.timeout_secs.unwrap_or(self.config.task_timeout_secs);

        let bounded = async move {
            if timeout_secs == 0 {
                return body.await;
            }
            match tokio::time::timeout(Duration::from_secs(timeout_secs), body).await {
                Ok(result) => result,
                Err(_) => Err(WeftError::TaskTimeout {
                    task: task.id.clone(),
                    timeout_secs,
                }),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(WeftError::Cancelled),
            result = bounded => result,
        }
    }

    /// Resolve a task's declared inputs, layered over `base` when given.
    fn task_args(&self, task: &TaskDefinition, base: Option<&Context>, scope: Scope<'_>) -> ResolvedInputs {
        let mut resolved = resolve_inputs(&task.inputs, &scope);
        if !resolved.is_complete() {
            let missing: Vec<&str> = resolved.missing.iter().map(|m| m.reference.as_str()).collect();
            debug!(task_id = %task.id, missing = ?missing, "Unresolved input references");
        }
        if let Some(base) = base {
            let mut merged = base.clone();
            merged.extend(std::mem::take(&mut resolved.values));
            resolved.values = merged;
        }
        resolved
    }

    async fn dispatch(
        &self,
        task: &TaskDefinition,
        args: ResolvedInputs,
        scope: Scope<'_>,
        tally: &Tally,
        cancel: &CancellationToken,
        depth: usize,
    ) -> Result<Value> {
        match task.task_type {
            TaskType::Agent => self.run_agent_task(task, args, tally, cancel).await,
            TaskType::Tool => {
                let tool_id = task.tool_id.as_deref().ok_or_else(|| {
                    WeftError::InvalidWorkflow(format!("Task {} requires tool_id", task.id))
                })?;
                self.tools.execute(tool_id, args.values).await
            }
            TaskType::Condition => {
                let condition = task.condition.as_deref().ok_or_else(|| {
                    WeftError::InvalidWorkflow(format!("Task {} requires a condition", task.id))
                })?;
                let passed = evaluate_bool(condition, &expression_scope(&args.values, scope.results))?;
                Ok(json!({ "condition_result": passed }))
            }
            TaskType::Loop => {
                self.run_loop(task, args.values, scope, tally, cancel, depth)
                    .await
            }
            // Fan-out is already expressed by independent tasks in one round.
            TaskType::Parallel => Ok(Value::Object(args.values)),
            TaskType::HumanInLoop => match &self.human {
                Some(hook) => hook.request(&task.id, &args.values).await,
                None => Err(WeftError::InvalidWorkflow(format!(
                    "Task {} is human_in_loop but no approval hook is configured",
                    task.id
                ))),
            },
        }
    }

    async fn run_agent_task(
        &self,
        task: &TaskDefinition,
        args: ResolvedInputs,
        tally: &Tally,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let agent_id = task.agent_id.as_deref().ok_or_else(|| {
            WeftError::InvalidWorkflow(format!("Task {} requires agent_id", task.id))
        })?;

        let text = match args.values.get("task") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                let detail = args
                    .missing
                    .iter()
                    .find(|m| m.input == "task")
                    .map(|m| format!(" ({} did not resolve)", m.reference))
                    .unwrap_or_default();
                return Err(WeftError::InvalidArguments(format!(
                    "Task {} has no 'task' input{}",
                    task.id, detail
                )));
            }
        };

        let result = self
            .orchestrator
            .execute_agent_with_cancel(agent_id, &text, &args.values, None, cancel)
            .await;
        tally.record(&result.metrics);

        match result.state {
            ExecutionState::Completed => Ok(agent_value(result.result)),
            ExecutionState::Cancelled => Err(WeftError::Cancelled),
            _ => Err(WeftError::AgentFailed {
                agent: agent_id.to_string(),
                message: result.error.unwrap_or_default(),
            }),
        }
    }

    async fn run_loop(
        &self,
        task: &TaskDefinition,
        args: Context,
        scope: Scope<'_>,
        tally: &Tally,
        cancel: &CancellationToken,
        depth: usize,
    ) -> Result<Value> {
        if depth >= MAX_LOOP_DEPTH {
            return Err(WeftError::InvalidWorkflow(format!(
                "Loop {} is nested more than {} levels deep",
                task.id, MAX_LOOP_DEPTH
            )));
        }
        let config = task.loop_config.as_ref().ok_or_else(|| {
            WeftError::InvalidWorkflow(format!("Task {} requires a loop config", task.id))
        })?;
        let items = match resolve_value(&config.items, &scope) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(WeftError::InvalidArguments(format!(
                    "Loop {} items must be an array, got {}",
                    task.id, other
                )))
            }
            None => {
                return Err(WeftError::InvalidArguments(format!(
                    "Loop {} items reference {} did not resolve",
                    task.id, config.items
                )))
            }
        };
        let body = self
            .definition
            .task(&config.body)
            .ok_or_else(|| WeftError::UnknownTask(config.body.clone()))?;

        debug!(
            task_id = %task.id,
            body = %body.id,
            items = items.len(),
            parallel = config.parallel,
            "Running loop"
        );

        let iterations: Vec<Context> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let mut base = scope.inputs.clone();
                base.extend(args.clone());
                base.insert("item".to_string(), item);
                base.insert("index".to_string(), json!(index));
                base
            })
            .collect();

        let values = if config.parallel {
            let batch = iterations.iter().enumerate().map(|(index, base)| {
                self.run_iteration(task, body, index, base, scope, tally, cancel, depth)
            });
            let results = join_all(batch).await;
            if results.iter().any(|r| matches!(r, Err(WeftError::Cancelled))) {
                return Err(WeftError::Cancelled);
            }
            results.into_iter().collect::<Result<Vec<_>>>()?
        } else {
            let mut values = Vec::with_capacity(iterations.len());
            for (index, base) in iterations.iter().enumerate() {
                values.push(
                    self.run_iteration(task, body, index, base, scope, tally, cancel, depth)
                        .await?,
                );
            }
            values
        };
        Ok(Value::Array(values))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        &self,
        loop_task: &TaskDefinition,
        body: &TaskDefinition,
        index: usize,
        base: &Context,
        scope: Scope<'_>,
        tally: &Tally,
        cancel: &CancellationToken,
        depth: usize,
    ) -> Result<Value> {
        let iteration_scope = Scope {
            inputs: base,
            results: scope.results,
            task_ids: scope.task_ids,
        };
        match self
            .run_task(body, Some(base), iteration_scope, tally, cancel, depth + 1)
            .await
        {
            TaskOutcome::Completed(value) | TaskOutcome::Skipped(value) => Ok(value),
            TaskOutcome::Failed(message) => Err(WeftError::LoopIteration {
                task: loop_task.id.clone(),
                index,
                message,
            }),
            TaskOutcome::Cancelled => Err(WeftError::Cancelled),
        }
    }
}

/// Condition expressions see only `inputs` and `results`.
fn expression_scope(inputs: &Context, results: &HashMap<String, Value>) -> Context {
    let mut scope = Context::new();
    scope.insert("inputs".to_string(), Value::Object(inputs.clone()));
    scope.insert(
        "results".to_string(),
        Value::Object(results.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    scope
}

/// Agent text that is a JSON object is stored as that object.
fn agent_value(result: Option<Value>) -> Value {
    match result {
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Object(map)) => Value::Object(map),
            _ => Value::String(text),
        },
        Some(other) => other,
        None => Value::Null,
    }
}

fn finish_metrics(mut metrics: ExecutionMetrics, tally: &Tally, start: Instant) -> ExecutionMetrics {
    tally.apply(&mut metrics);
    metrics.elapsed_ms = start.elapsed().as_millis() as u64;
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use weft_core::event::InMemoryEventBus;
    use weft_core::workflow::{ErrorHandling, RetryConfig};
    use weft_memory::InMemoryStateStore;
    use weft_test_utils::{
        agent_def, ctx, FailingTool, FlakyTool, RecordingTool, ScriptedLlm, SlowTool, StaticTool,
    };

    use crate::agent_loop::Agent;
    use crate::graph::retry::MAX_BACKOFF;
    use crate::pool::AgentPool;

    fn orchestrator(agents: Vec<(&str, Arc<ScriptedLlm>)>) -> Arc<Orchestrator> {
        let pool = Arc::new(AgentPool::new());
        for (id, llm) in agents {
            pool.register(Agent::new(agent_def(id, &[]), llm, &ToolRegistry::new()));
        }
        Arc::new(Orchestrator::new(
            pool,
            Arc::new(InMemoryStateStore::new()),
            Arc::new(InMemoryEventBus::default()),
        ))
    }

    fn engine(def: WorkflowDefinition, tools: ToolRegistry) -> WorkflowEngine {
        WorkflowEngine::new(def, orchestrator(vec![]), tools).unwrap()
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: 0.5,
            max_delay: 2.0,
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn references_flow_between_tasks() {
        let source = Arc::new(StaticTool::new("source", json!({"x": 5})));
        let sink = Arc::new(RecordingTool::new("sink"));
        let mut tools = ToolRegistry::new();
        tools.register_arc(source.clone());
        tools.register_arc(sink.clone());

        let def = WorkflowDefinition::new("wf", "refs")
            .with_task(TaskDefinition::tool("T1", "source"))
            .with_task(TaskDefinition::tool("T2", "sink").with_input("v", json!("$T1.x")))
            .with_dependency("T2", &["T1"]);

        let result = engine(def, tools).execute(Context::new(), None).await;

        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(sink.calls()[0]["v"], 5);
        assert_eq!(result.result, Some(json!({"v": 5})));
        assert_eq!(result.metrics.tasks_completed, 2);
        assert_eq!(result.metrics.rounds, 2);
        assert!(result.trace_id.is_some());
    }

    #[tokio::test]
    async fn failure_blocks_downstream_and_names_task() {
        let sink = Arc::new(RecordingTool::new("sink"));
        let mut tools = ToolRegistry::new();
        tools.register(FailingTool::new("broken", "exploded"));
        tools.register_arc(sink.clone());

        let def = WorkflowDefinition::new("wf", "fail")
            .with_task(TaskDefinition::tool("T1", "broken"))
            .with_task(TaskDefinition::tool("T2", "sink"))
            .with_dependency("T2", &["T1"]);

        let result = engine(def, tools).execute(Context::new(), None).await;

        assert_eq!(result.state, ExecutionState::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("T1"));
        assert!(error.contains("exploded"));
        assert!(sink.calls().is_empty());
        assert_eq!(result.metrics.tasks_failed, 1);
        assert_eq!(result.metrics.tasks_completed, 0);
    }

    #[tokio::test]
    async fn sibling_failure_does_not_abort_round() {
        let ok = Arc::new(StaticTool::new("ok", json!("fine")));
        let mut tools = ToolRegistry::new();
        tools.register(FailingTool::new("broken", "nope"));
        tools.register_arc(ok.clone());

        let def = WorkflowDefinition::new("wf", "siblings")
            .with_task(TaskDefinition::tool("bad", "broken"))
            .with_task(TaskDefinition::tool("good", "ok"));

        let result = engine(def, tools).execute(Context::new(), None).await;
        assert_eq!(result.state, ExecutionState::Failed);
        assert_eq!(ok.calls().len(), 1);
        assert_eq!(result.metrics.tasks_completed, 1);
        assert_eq!(result.metrics.rounds, 1);
    }

    #[tokio::test]
    async fn cycle_reports_stuck() {
        let mut tools = ToolRegistry::new();
        tools.register(StaticTool::new("noop", json!(null)));
        let def = WorkflowDefinition::new("wf", "cycle")
            .with_task(TaskDefinition::tool("a", "noop"))
            .with_task(TaskDefinition::tool("b", "noop"))
            .with_task(TaskDefinition::tool("c", "noop"))
            .with_dependency("a", &["b"])
            .with_dependency("b", &["a"]);

        let result = engine(def, tools).execute(Context::new(), None).await;
        assert_eq!(result.state, ExecutionState::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("stuck"));
        assert!(error.contains("a, b"));
        assert_eq!(result.metrics.tasks_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_reattempts_with_backoff() {
        let flaky = Arc::new(FlakyTool::new("flaky", 2, json!("third time")));
        let mut tools = ToolRegistry::new();
        tools.register_arc(flaky.clone());

        let def = WorkflowDefinition::new("wf", "retry").with_task(
            TaskDefinition::tool("t", "flaky")
                .with_on_error(OnError::Retry)
                .with_retry(fast_retry(3)),
        );

        let start = Instant::now();
        let result = engine(def, tools).execute(Context::new(), None).await;
        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(result.result, Some(json!("third time")));
        assert_eq!(flaky.attempts(), 3);
        // 0.5s + 1.0s of backoff
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let broken = Arc::new(FailingTool::new("broken", "still down"));
        let mut tools = ToolRegistry::new();
        tools.register_arc(broken.clone());

        let def = WorkflowDefinition::new("wf", "retry").with_task(
            TaskDefinition::tool("t", "broken")
                .with_on_error(OnError::Retry)
                .with_retry(fast_retry(2)),
        );

        let result = engine(def, tools).execute(Context::new(), None).await;
        assert_eq!(result.state, ExecutionState::Failed);
        assert_eq!(broken.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn enormous_backoff_is_clamped_not_a_panic() {
        let broken = Arc::new(FailingTool::new("broken", "still down"));
        let mut tools = ToolRegistry::new();
        tools.register_arc(broken.clone());

        let def = WorkflowDefinition::new("wf", "huge-backoff").with_task(
            TaskDefinition::tool("t", "broken")
                .with_on_error(OnError::Retry)
                .with_retry(RetryConfig {
                    max_retries: 1,
                    initial_delay: 1e20,
                    max_delay: 1e20,
                    exponential_base: 2.0,
                    jitter: false,
                }),
        );
        let engine = engine(def, tools);

        let start = Instant::now();
        let run = tokio::spawn(async move { engine.execute(Context::new(), None).await });
        let result = run.await.unwrap();

        assert_eq!(result.state, ExecutionState::Failed);
        assert!(result.error.unwrap().contains("still down"));
        assert_eq!(broken.attempts(), 2);
        assert!(start.elapsed() >= MAX_BACKOFF);
    }

    #[test]
    fn non_finite_retry_delays_are_rejected_at_construction() {
        let def = WorkflowDefinition::new("wf", "bad-retry").with_task(
            TaskDefinition::tool("t", "x")
                .with_on_error(OnError::Retry)
                .with_retry(RetryConfig {
                    initial_delay: f64::INFINITY,
                    ..fast_retry(1)
                }),
        );
        let err = WorkflowEngine::new(def, orchestrator(vec![]), ToolRegistry::new())
            .err()
            .unwrap();
        assert!(matches!(err, WeftError::InvalidWorkflow(ref m) if m.contains("initial_delay")));
    }

    #[tokio::test]
    async fn fail_policy_does_not_retry() {
        let broken = Arc::new(FailingTool::new("broken", "down"));
        let mut tools = ToolRegistry::new();
        tools.register_arc(broken.clone());
        let def = WorkflowDefinition::new("wf", "once")
            .with_task(TaskDefinition::tool("t", "broken").with_retry(fast_retry(5)));

        engine(def, tools).execute(Context::new(), None).await;
        assert_eq!(broken.attempts(), 1);
    }

    #[tokio::test]
    async fn skip_and_continue_satisfy_downstream() {
        let sink = Arc::new(RecordingTool::new("sink"));
        let mut tools = ToolRegistry::new();
        tools.register(FailingTool::new("broken", "bad input"));
        tools.register_arc(sink.clone());

        let def = WorkflowDefinition::new("wf", "policies")
            .with_task(TaskDefinition::tool("skipped", "broken").with_on_error(OnError::Skip))
            .with_task(TaskDefinition::tool("continued", "broken").with_on_error(OnError::Continue))
            .with_task(
                TaskDefinition::tool("after", "sink")
                    .with_input("reason", json!("$continued.error"))
                    .with_input("flag", json!("$continued.skipped")),
            )
            .with_dependency("after", &["skipped", "continued"]);

        let result = engine(def, tools).execute(Context::new(), None).await;

        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(result.metrics.tasks_skipped, 2);
        assert_eq!(result.metrics.tasks_completed, 1);
        let call = &sink.calls()[0];
        assert!(call["reason"].as_str().unwrap().contains("bad input"));
        assert_eq!(call["flag"], true);
    }

    #[tokio::test]
    async fn fallback_substitutes_result() {
        let backup = Arc::new(StaticTool::new("backup", json!({"source": "cache"})));
        let mut tools = ToolRegistry::new();
        tools.register(FailingTool::new("primary", "offline"));
        tools.register_arc(backup.clone());

        let def = WorkflowDefinition::new("wf", "fallback")
            .with_task(
                TaskDefinition::tool("fetch", "primary")
                    .with_input("url", json!("https://example.com"))
                    .with_fallback("fetch_cached"),
            )
            .with_task(TaskDefinition::tool("fetch_cached", "backup"));

        let result = engine(def, tools).execute(Context::new(), None).await;

        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(result.result, Some(json!({"source": "cache"})));
        // Runs once as the fallback, never on its own.
        assert_eq!(backup.calls().len(), 1);
        assert_eq!(backup.calls()[0]["url"], "https://example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn task_timeout_is_a_failure() {
        let mut tools = ToolRegistry::new();
        tools.register(SlowTool::new("slow", Duration::from_secs(10), json!("late")));

        let def = WorkflowDefinition::new("wf", "timeout")
            .with_task(TaskDefinition::tool("t", "slow").with_timeout(1));

        let result = engine(def, tools).execute(Context::new(), None).await;
        assert_eq!(result.state, ExecutionState::Failed);
        assert!(result.error.unwrap().contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn condition_tasks_and_guards() {
        let sink = Arc::new(RecordingTool::new("sink"));
        let mut tools = ToolRegistry::new();
        tools.register_arc(sink.clone());

        let def = WorkflowDefinition::new("wf", "branch")
            .with_task(
                TaskDefinition::condition("big", "inputs.n > 3").with_input("n", json!("$count")),
            )
            .with_task(
                TaskDefinition::tool("when_big", "sink")
                    .with_guard("results.big.condition_result == true"),
            )
            .with_task(
                TaskDefinition::tool("when_small", "sink")
                    .with_guard("not results.big.condition_result"),
            )
            .with_dependency("when_big", &["big"])
            .with_dependency("when_small", &["big"]);

        let result = engine(def, tools)
            .execute(ctx(json!({"count": 7})), None)
            .await;

        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(sink.calls().len(), 1);
        assert_eq!(result.metrics.tasks_skipped, 1);
        assert_eq!(result.metrics.tasks_completed, 2);
    }

    #[tokio::test]
    async fn loop_runs_body_per_item() {
        let sink = Arc::new(RecordingTool::new("sink"));
        let mut tools = ToolRegistry::new();
        tools.register_arc(sink.clone());

        let def = WorkflowDefinition::new("wf", "loop")
            .with_task(
                TaskDefinition::looping("each", json!("$names"), "greet")
                    .with_input("greeting", json!("hello")),
            )
            .with_task(TaskDefinition::tool("greet", "sink").with_input("who", json!("$item")));

        let result = engine(def, tools)
            .execute(ctx(json!({"names": ["ada", "linus"]})), None)
            .await;

        assert_eq!(result.state, ExecutionState::Completed);
        let items = result.result.unwrap();
        assert_eq!(items[0]["who"], "ada");
        assert_eq!(items[1]["who"], "linus");
        assert_eq!(items[1]["index"], 1);
        assert_eq!(items[0]["greeting"], "hello");
        assert_eq!(sink.calls().len(), 2);
        // The body is detached and never scheduled on its own.
        assert_eq!(result.metrics.tasks_completed, 1);
    }

    #[tokio::test]
    async fn parallel_loop_reports_failing_iteration() {
        struct PickyTool;
        impl weft_core::traits::Tool for PickyTool {
            fn id(&self) -> &str {
                "picky"
            }
            fn description(&self) -> &str {
                "Rejects odd numbers"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            fn execute(&self, args: Context) -> BoxFuture<'_, Result<Value>> {
                Box::pin(async move {
                    match args.get("item").and_then(Value::as_i64) {
                        Some(n) if n % 2 == 0 => Ok(json!(n)),
                        _ => Err(WeftError::ToolExecution {
                            tool: "picky".into(),
                            message: "odd".into(),
                        }),
                    }
                })
            }
        }

        let mut tools = ToolRegistry::new();
        tools.register(PickyTool);
        let def = WorkflowDefinition::new("wf", "loop")
            .with_task(TaskDefinition::looping("each", json!([2, 3, 4]), "check").with_parallel_loop())
            .with_task(TaskDefinition::tool("check", "picky"));

        let result = engine(def, tools).execute(Context::new(), None).await;
        assert_eq!(result.state, ExecutionState::Failed);
        assert!(result.error.unwrap().contains("iteration 1"));
    }

    #[tokio::test]
    async fn agent_tasks_go_through_orchestrator() {
        let llm = Arc::new(ScriptedLlm::new().with_text(r#"{"summary": "short", "words": 2}"#));
        let sink = Arc::new(RecordingTool::new("sink"));
        let mut tools = ToolRegistry::new();
        tools.register_arc(sink.clone());

        let def = WorkflowDefinition::new("wf", "agents")
            .with_task(
                TaskDefinition::agent("write", "writer")
                    .with_input("task", json!("Summarize $$ figures"))
                    .with_input("topic", json!("$topic")),
            )
            .with_task(TaskDefinition::tool("publish", "sink").with_input("text", json!("$write.summary")))
            .with_dependency("publish", &["write"]);

        let engine = WorkflowEngine::new(def, orchestrator(vec![("writer", llm.clone())]), tools).unwrap();
        let result = engine.execute(ctx(json!({"topic": "q3"})), None).await;

        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(sink.calls()[0]["text"], "short");
        assert_eq!(result.metrics.iterations, 1);
        let prompt = &llm.last_request().unwrap().messages[1].content;
        assert!(prompt.starts_with("Summarize $$ figures"));
        assert!(prompt.contains("topic: q3"));
    }

    #[tokio::test]
    async fn agent_task_failures() {
        let def = WorkflowDefinition::new("wf", "agents")
            .with_task(TaskDefinition::agent("ghost_task", "ghost").with_input("task", json!("hi")))
            .with_task(TaskDefinition::agent("no_text", "writer").with_input("task", json!("$missing")));

        let engine = WorkflowEngine::new(
            def,
            orchestrator(vec![("writer", Arc::new(ScriptedLlm::new()))]),
            ToolRegistry::new(),
        )
        .unwrap();
        let result = engine.execute(Context::new(), None).await;

        let error = result.error.unwrap();
        assert!(error.contains("Agent ghost not found"));
        assert!(error.contains("no 'task' input ($missing did not resolve)"));
    }

    #[tokio::test]
    async fn output_task_selects_result() {
        let mut tools = ToolRegistry::new();
        tools.register(StaticTool::new("a", json!("from a")));
        tools.register(StaticTool::new("b", json!("from b")));

        let def = WorkflowDefinition::new("wf", "output")
            .with_task(TaskDefinition::tool("first", "a"))
            .with_task(TaskDefinition::tool("second", "b"))
            .with_dependency("second", &["first"])
            .with_output_task("first");

        let result = engine(def, tools).execute(Context::new(), None).await;
        assert_eq!(result.result, Some(json!("from a")));
    }

    #[tokio::test]
    async fn cancelled_token_stops_run() {
        let sink = Arc::new(RecordingTool::new("sink"));
        let mut tools = ToolRegistry::new();
        tools.register_arc(sink.clone());
        let def = WorkflowDefinition::new("wf", "cancel").with_task(TaskDefinition::tool("t", "sink"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine(def, tools)
            .execute_with_cancel(Context::new(), Some("wf-run".into()), cancel)
            .await;

        assert_eq!(result.state, ExecutionState::Cancelled);
        assert_eq!(result.execution_id, "wf-run");
        assert!(sink.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_loop_is_not_absorbed_by_its_policy() {
        for policy in [OnError::Skip, OnError::Continue] {
            for parallel in [false, true] {
                let mut tools = ToolRegistry::new();
                tools.register(SlowTool::new("slow", Duration::from_secs(20), json!("done")));

                let mut each = TaskDefinition::looping("each", json!([1, 2, 3]), "work")
                    .with_on_error(policy);
                if parallel {
                    each = each.with_parallel_loop();
                }
                let def = WorkflowDefinition::new("wf", "loop-cancel")
                    .with_task(each)
                    .with_task(TaskDefinition::tool("work", "slow").with_on_error(policy));

                let cancel = CancellationToken::new();
                let trigger = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    trigger.cancel();
                });

                let result = engine(def, tools)
                    .execute_with_cancel(Context::new(), None, cancel)
                    .await;
                assert_eq!(
                    result.state,
                    ExecutionState::Cancelled,
                    "{:?} parallel={}",
                    policy,
                    parallel
                );
                assert_eq!(result.metrics.tasks_skipped, 0);
                assert_eq!(result.metrics.tasks_completed, 0);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn round_outcome_does_not_depend_on_finish_order() {
        async fn run(delays_ms: [u64; 3]) -> (ExecutionResult, Vec<Context>) {
            let sink = Arc::new(RecordingTool::new("sink"));
            let mut tools = ToolRegistry::new();
            for (id, (ms, value)) in ["a", "b", "c"].iter().zip(delays_ms.iter().zip(["A", "B", "C"])) {
                tools.register(SlowTool::new(id, Duration::from_millis(*ms), json!(value)));
            }
            tools.register(FailingTool::new("broken", "nope"));
            tools.register_arc(sink.clone());

            let def = WorkflowDefinition::new("wf", "one-round")
                .with_task(TaskDefinition::tool("a", "a"))
                .with_task(TaskDefinition::tool("b", "b"))
                .with_task(TaskDefinition::tool("c", "c"))
                .with_task(TaskDefinition::tool("bad", "broken"))
                .with_task(
                    TaskDefinition::tool("join", "sink")
                        .with_input("a", json!("$a"))
                        .with_input("b", json!("$b"))
                        .with_input("c", json!("$c")),
                )
                .with_task(TaskDefinition::tool("after_bad", "sink"))
                .with_dependency("join", &["a", "b", "c"])
                .with_dependency("after_bad", &["bad"]);

            let result = engine(def, tools).execute(Context::new(), None).await;
            (result, sink.calls())
        }

        let (declared, declared_calls) = run([10, 20, 30]).await;
        let (reversed, reversed_calls) = run([30, 20, 10]).await;

        for result in [&declared, &reversed] {
            assert_eq!(result.state, ExecutionState::Failed);
            assert_eq!(result.metrics.tasks_completed, 4);
            assert_eq!(result.metrics.tasks_failed, 1);
            assert_eq!(result.metrics.rounds, 2);
        }
        assert_eq!(declared.error, reversed.error);
        assert_eq!(declared.result, reversed.result);
        assert_eq!(declared_calls, reversed_calls);
        assert_eq!(declared_calls.len(), 1);
        assert_eq!(declared_calls[0]["b"], "B");
    }

    #[tokio::test]
    async fn orchestrator_can_cancel_running_workflow() {
        let mut tools = ToolRegistry::new();
        tools.register(SlowTool::new("slow", Duration::from_secs(3600), json!(null)));
        let def = WorkflowDefinition::new("wf", "cancel").with_task(TaskDefinition::tool("t", "slow"));

        let orchestrator = orchestrator(vec![]);
        let engine = Arc::new(WorkflowEngine::new(def, orchestrator.clone(), tools).unwrap());
        let runner = engine.clone();
        let run = tokio::spawn(async move { runner.execute(Context::new(), Some("wf-1".into())).await });

        while !orchestrator.is_active("wf-1") {
            tokio::task::yield_now().await;
        }
        assert!(orchestrator.cancel_execution("wf-1").await);

        let result = run.await.unwrap();
        assert_eq!(result.state, ExecutionState::Cancelled);
    }

    #[tokio::test]
    async fn human_in_loop_uses_hook() {
        struct Approver(Mutex<Vec<String>>);
        impl HumanInLoopHook for Approver {
            fn request<'a>(&'a self, task_id: &'a str, _inputs: &'a Context) -> BoxFuture<'a, Result<Value>> {
                Box::pin(async move {
                    self.0.lock().unwrap().push(task_id.to_string());
                    Ok(json!({"approved": true}))
                })
            }
        }

        let def = WorkflowDefinition::new("wf", "approval")
            .with_task(TaskDefinition::new("sign_off", TaskType::HumanInLoop));

        let without = engine(def.clone(), ToolRegistry::new())
            .execute(Context::new(), None)
            .await;
        assert!(without.error.unwrap().contains("no approval hook"));

        let approver = Arc::new(Approver(Mutex::new(Vec::new())));
        let with = engine(def, ToolRegistry::new())
            .with_human_hook(approver.clone())
            .execute(Context::new(), None)
            .await;
        assert_eq!(with.result, Some(json!({"approved": true})));
        assert_eq!(*approver.0.lock().unwrap(), vec!["sign_off".to_string()]);
    }

    #[test]
    fn construction_rejects_bad_definitions() {
        let def = WorkflowDefinition::new("wf", "bad")
            .with_task(TaskDefinition::tool("a", "x"))
            .with_dependency("a", &["ghost"]);
        let err = WorkflowEngine::new(def, orchestrator(vec![]), ToolRegistry::new())
            .err()
            .unwrap();
        assert!(err.is_definition());
    }

    #[test]
    fn workflow_level_policy_applies_to_tasks() {
        let mut def = WorkflowDefinition::new("wf", "defaults")
            .with_task(TaskDefinition::tool("a", "x"));
        def.error_handling = ErrorHandling {
            on_error: OnError::Skip,
            ..Default::default()
        };
        let task = def.task("a").unwrap();
        assert_eq!(def.error_handling_for(task).on_error, OnError::Skip);
    }
}
