use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::{CircuitBreakerConfig, OrchestratorConfig, ResilienceConfig};
use weft_core::error::{Result, WeftError};
use weft_core::event::{
    EXECUTION_CANCELLED, EXECUTION_COMPLETED, EXECUTION_FAILED, EXECUTION_STARTED,
};
use weft_core::traits::{EventBus, StateStore};
use weft_core::types::*;
use weft_resilience::{CircuitBreaker, CostTracker, RateLimiter};

use crate::agent_loop::Agent;
use crate::pool::AgentPool;

/// How `coordinate_agents` runs a group of agents against one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationPattern {
    /// All agents at once; failures are independent.
    Parallel,
    /// In order, each agent seeing earlier results as `previous_result_{id}`.
    Sequential,
    /// The first agent coordinates; the rest run only if it completes.
    Hierarchical,
}

impl CoordinationPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Hierarchical => "hierarchical",
        }
    }
}

impl std::fmt::Display for CoordinationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoordinationPattern {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "hierarchical" => Ok(Self::Hierarchical),
            other => Err(WeftError::InvalidArguments(format!(
                "Unknown coordination pattern: {}",
                other
            ))),
        }
    }
}

/// Stored under `execution:{id}` for every agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub agent_id: String,
    pub task: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionSnapshot {
    fn running(execution_id: &str, agent_id: &str, task: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            agent_id: agent_id.to_string(),
            task: task.to_string(),
            state: ExecutionState::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    fn finish(&mut self, state: ExecutionState, error: Option<String>) {
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

fn snapshot_key(execution_id: &str) -> String {
    format!("execution:{}", execution_id)
}

fn result_key(execution_id: &str) -> String {
    format!("execution:{}:result", execution_id)
}

fn error_key(execution_id: &str) -> String {
    format!("execution:{}:error", execution_id)
}

/// Where a tracked execution stands with respect to cancellation. The
/// slot decides which side owns the terminal snapshot write.
enum ActiveSlot {
    Running(CancellationToken),
    /// `cancel_execution` won; the run records itself as Cancelled.
    Cancelled,
    /// The run claimed its own terminal state; cancels are refused.
    Finishing,
}

/// Removes an execution's cancellation slot when the run ends or its
/// future is dropped.
pub struct CancellationGuard<'a> {
    active: &'a Mutex<HashMap<String, ActiveSlot>>,
    execution_id: String,
}

impl Drop for CancellationGuard<'_> {
    fn drop(&mut self) {
        let mut active = match self.active.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&self.execution_id);
    }
}

/// Aborts the spawned agent task if the awaiting future is dropped.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs agents from an [`AgentPool`], persisting execution snapshots and
/// publishing lifecycle events.
///
/// Every entry point returns an [`ExecutionResult`]; agent errors, unknown
/// agents, open circuits and rate-limit rejections are reported as Failed
/// results. State store and event bus failures are logged and otherwise
/// ignored.
pub struct Orchestrator {
    pool: Arc<AgentPool>,
    state: Arc<dyn StateStore>,
    events: Arc<dyn EventBus>,
    config: OrchestratorConfig,
    limiter: Option<Arc<RateLimiter>>,
    breaker_config: Option<CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    costs: Option<Arc<CostTracker>>,
    active: Mutex<HashMap<String, ActiveSlot>>,
}

impl Orchestrator {
    pub fn new(pool: Arc<AgentPool>, state: Arc<dyn StateStore>, events: Arc<dyn EventBus>) -> Self {
        Self {
            pool,
            state,
            events,
            config: OrchestratorConfig::default(),
            limiter: None,
            breaker_config: None,
            breakers: Mutex::new(HashMap::new()),
            costs: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Reject agent executions once `agent_id` exceeds the limiter's window.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Guard every agent with its own circuit breaker built from `config`.
    pub fn with_circuit_breakers(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = Some(config);
        self
    }

    pub fn with_cost_tracker(mut self, costs: Arc<CostTracker>) -> Self {
        self.costs = Some(costs);
        self
    }

    /// Circuit breakers, cost tracking, and the optional rate limit from a
    /// `[resilience]` config section.
    pub fn with_resilience(mut self, config: &ResilienceConfig) -> Self {
        self.breaker_config = Some(config.circuit_breaker.clone());
        self.costs = Some(Arc::new(CostTracker::with_overrides(&config.pricing)));
        if let Some(rate) = &config.rate_limit {
            self.limiter = Some(Arc::new(RateLimiter::from_config(rate)));
        }
        self
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn costs(&self) -> Option<&Arc<CostTracker>> {
        self.costs.as_ref()
    }

    /// The breaker guarding `agent_id`, if breakers are enabled. Created on
    /// first use.
    pub fn breaker(&self, agent_id: &str) -> Option<Arc<CircuitBreaker>> {
        let config = self.breaker_config.as_ref()?;
        let mut breakers = lock(&self.breakers);
        let breaker = breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::from_config(
                    format!("agent:{}", agent_id),
                    config,
                ))
            })
            .clone();
        Some(breaker)
    }

    /// Track `token` under `execution_id` so `cancel_execution` can trip it.
    pub fn register_cancellation(
        &self,
        execution_id: &str,
        token: CancellationToken,
    ) -> CancellationGuard<'_> {
        lock(&self.active).insert(execution_id.to_string(), ActiveSlot::Running(token));
        CancellationGuard {
            active: &self.active,
            execution_id: execution_id.to_string(),
        }
    }

    /// True while the execution is running and can still be cancelled.
    pub fn is_active(&self, execution_id: &str) -> bool {
        matches!(
            lock(&self.active).get(execution_id),
            Some(ActiveSlot::Running(_))
        )
    }

    /// Take ownership of the terminal transition. False means a cancel got
    /// there first and the run must finish as Cancelled.
    fn claim_finish(&self, execution_id: &str) -> bool {
        let mut active = lock(&self.active);
        match active.get_mut(execution_id) {
            Some(slot) if matches!(slot, ActiveSlot::Running(_)) => {
                *slot = ActiveSlot::Finishing;
                true
            }
            _ => false,
        }
    }

    fn ttl(&self) -> Option<Duration> {
        match self.config.state_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    async fn persist(&self, key: &str, value: serde_json::Value) {
        if let Err(e) = self.state.set(key, value, self.ttl()).await {
            warn!(key = %key, error = %e, "Failed to persist execution state");
        }
    }

    async fn persist_snapshot(&self, snapshot: &ExecutionSnapshot) {
        match serde_json::to_value(snapshot) {
            Ok(value) => self.persist(&snapshot_key(&snapshot.execution_id), value).await,
            Err(e) => warn!(error = %e, "Failed to serialize execution snapshot"),
        }
    }

    async fn emit(&self, event_type: &str, execution_id: &str, payload: serde_json::Value) {
        let event = Event::new(event_type, self.config.source.clone(), payload)
            .correlated(execution_id);
        if let Err(e) = self.events.publish(event).await {
            warn!(event_type = %event_type, error = %e, "Failed to publish event");
        }
    }

    pub async fn execute_agent(
        &self,
        agent_id: &str,
        task: &str,
        context: &Context,
        execution_id: Option<String>,
    ) -> ExecutionResult {
        self.execute_agent_with_cancel(agent_id, task, context, execution_id, &CancellationToken::new())
            .await
    }

    /// Like [`execute_agent`](Self::execute_agent), with the run's token
    /// derived from `parent` so cancelling the parent cancels this run.
    pub async fn execute_agent_with_cancel(
        &self,
        agent_id: &str,
        task: &str,
        context: &Context,
        execution_id: Option<String>,
        parent: &CancellationToken,
    ) -> ExecutionResult {
        let execution_id = ExecutionId::or_new(execution_id).to_string();
        let start = Instant::now();

        let Some(agent) = self.pool.get(agent_id) else {
            warn!(agent_id = %agent_id, execution_id = %execution_id, "Agent not found");
            return ExecutionResult::failed(
                execution_id,
                WeftError::AgentNotFound(agent_id.to_string()).to_string(),
            );
        };

        let cancel = parent.child_token();
        let _active = self.register_cancellation(&execution_id, cancel.clone());

        let mut snapshot = ExecutionSnapshot::running(&execution_id, agent_id, task);
        self.persist_snapshot(&snapshot).await;
        self.emit(
            EXECUTION_STARTED,
            &execution_id,
            json!({"execution_id": execution_id, "agent_id": agent_id, "task": task}),
        )
        .await;
        info!(agent_id = %agent_id, execution_id = %execution_id, "Agent execution started");

        let breaker = self.breaker(agent_id);
        if let Err(e) = self.admit(agent_id, breaker.as_deref()) {
            warn!(agent_id = %agent_id, execution_id = %execution_id, error = %e, "Agent execution rejected");
            let metrics = ExecutionMetrics {
                elapsed_ms: start.elapsed().as_millis() as u64,
                ..Default::default()
            };
            if !self.claim_finish(&execution_id) {
                return self.finish_cancelled(&mut snapshot, None, metrics, false).await;
            }
            return self
                .finish_failed(&mut snapshot, e.to_string(), metrics)
                .await;
        }

        let outcome = run_spawned(agent.clone(), task, context, cancel).await;
        let cancelled_by_request = !self.claim_finish(&execution_id);
        let state = if cancelled_by_request {
            ExecutionState::Cancelled
        } else {
            outcome.state
        };

        if let Some(breaker) = &breaker {
            if state != ExecutionState::Cancelled {
                breaker.record(state == ExecutionState::Completed);
            }
        }
        if let Some(costs) = &self.costs {
            let cost = costs.record_usage(
                agent_id,
                &agent.definition().model,
                outcome.usage.prompt_tokens,
                outcome.usage.completion_tokens,
            );
            debug!(agent_id = %agent_id, cost, "Recorded agent cost");
        }

        let metrics = ExecutionMetrics {
            iterations: outcome.iterations,
            prompt_tokens: outcome.usage.prompt_tokens,
            completion_tokens: outcome.usage.completion_tokens,
            elapsed_ms: start.elapsed().as_millis() as u64,
            ..Default::default()
        };

        match state {
            ExecutionState::Completed => {
                let payload = serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null);
                self.persist(&result_key(&execution_id), payload.clone()).await;
                snapshot.finish(ExecutionState::Completed, None);
                self.persist_snapshot(&snapshot).await;
                self.emit(
                    EXECUTION_COMPLETED,
                    &execution_id,
                    json!({"execution_id": execution_id, "agent_id": agent_id, "result": payload}),
                )
                .await;
                info!(
                    agent_id = %agent_id,
                    execution_id = %execution_id,
                    iterations = outcome.iterations,
                    "Agent execution completed"
                );
                ExecutionResult::completed(
                    execution_id,
                    outcome.result.map(serde_json::Value::String),
                )
                .with_metrics(metrics)
            }
            ExecutionState::Cancelled => {
                // cancel_execution has already published for its own requests.
                self.finish_cancelled(&mut snapshot, outcome.error, metrics, !cancelled_by_request)
                    .await
            }
            _ => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "Agent finished without a result".to_string());
                self.finish_failed(&mut snapshot, message, metrics).await
            }
        }
    }

    fn admit(&self, agent_id: &str, breaker: Option<&CircuitBreaker>) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.wait_if_needed(agent_id)?;
        }
        if let Some(breaker) = breaker {
            breaker.try_acquire()?;
        }
        Ok(())
    }

    async fn finish_failed(
        &self,
        snapshot: &mut ExecutionSnapshot,
        message: String,
        metrics: ExecutionMetrics,
    ) -> ExecutionResult {
        let execution_id = snapshot.execution_id.clone();
        error!(
            agent_id = %snapshot.agent_id,
            execution_id = %execution_id,
            error = %message,
            "Agent execution failed"
        );
        self.persist(&error_key(&execution_id), json!(message)).await;
        snapshot.finish(ExecutionState::Failed, Some(message.clone()));
        self.persist_snapshot(snapshot).await;
        self.emit(
            EXECUTION_FAILED,
            &execution_id,
            json!({"execution_id": execution_id, "agent_id": snapshot.agent_id, "error": message}),
        )
        .await;
        ExecutionResult::failed(execution_id, message).with_metrics(metrics)
    }

    async fn finish_cancelled(
        &self,
        snapshot: &mut ExecutionSnapshot,
        error: Option<String>,
        metrics: ExecutionMetrics,
        publish: bool,
    ) -> ExecutionResult {
        let execution_id = snapshot.execution_id.clone();
        let error = error.unwrap_or_else(|| WeftError::Cancelled.to_string());
        snapshot.finish(ExecutionState::Cancelled, Some(error));
        self.persist_snapshot(snapshot).await;
        if publish {
            self.emit(
                EXECUTION_CANCELLED,
                &execution_id,
                json!({"execution_id": execution_id, "agent_id": snapshot.agent_id}),
            )
            .await;
        }
        info!(agent_id = %snapshot.agent_id, execution_id = %execution_id, "Agent execution cancelled");
        ExecutionResult::cancelled(execution_id).with_metrics(metrics)
    }

    /// Run several agents against one task.
    pub async fn coordinate_agents(
        &self,
        agent_ids: &[String],
        task: &str,
        pattern: CoordinationPattern,
        context: &Context,
    ) -> HashMap<String, ExecutionResult> {
        info!(pattern = %pattern, agents = agent_ids.len(), "Coordinating agents");
        match pattern {
            CoordinationPattern::Parallel => self.run_parallel(agent_ids, task, context).await,
            CoordinationPattern::Sequential => {
                let mut context = context.clone();
                let mut results = HashMap::new();
                for agent_id in agent_ids {
                    let result = self.execute_agent(agent_id, task, &context, None).await;
                    if let Some(text) = result.result_text() {
                        context.insert(
                            format!("previous_result_{}", agent_id),
                            serde_json::Value::String(text),
                        );
                    }
                    results.insert(agent_id.clone(), result);
                }
                results
            }
            CoordinationPattern::Hierarchical => {
                let Some((coordinator, workers)) = agent_ids.split_first() else {
                    return HashMap::new();
                };
                let briefing = format!("{}\n\nAvailable workers: {:?}", task, workers);
                let lead = self.execute_agent(coordinator, &briefing, context, None).await;
                let lead_completed = lead.is_completed();

                let mut results = HashMap::new();
                results.insert(coordinator.clone(), lead);
                if !lead_completed {
                    warn!(coordinator = %coordinator, "Coordinator failed, workers not dispatched");
                    return results;
                }
                results.extend(self.run_parallel(workers, task, context).await);
                results
            }
        }
    }

    async fn run_parallel(
        &self,
        agent_ids: &[String],
        task: &str,
        context: &Context,
    ) -> HashMap<String, ExecutionResult> {
        let futs = agent_ids
            .iter()
            .map(|agent_id| self.execute_agent(agent_id, task, context, None));
        let results = futures::future::join_all(futs).await;
        agent_ids.iter().cloned().zip(results).collect()
    }

    /// The stored snapshot for an agent execution, if any.
    pub async fn get_execution_state(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>> {
        match self.state.get(&snapshot_key(execution_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Cancel an execution. Running agents stop at their next LLM or tool
    /// boundary and record themselves as Cancelled. Returns false when the
    /// execution is unknown, already cancelled, or already finishing.
    ///
    /// An execution this orchestrator is not running is cancelled only if
    /// its stored snapshot is still non-terminal.
    pub async fn cancel_execution(&self, execution_id: &str) -> bool {
        let token = {
            let mut active = lock(&self.active);
            match active.get_mut(execution_id) {
                Some(slot) => {
                    let ActiveSlot::Running(token) = slot else {
                        return false;
                    };
                    let token = token.clone();
                    *slot = ActiveSlot::Cancelled;
                    Some(token)
                }
                None => None,
            }
        };

        match token {
            Some(token) => token.cancel(),
            None => {
                let stored = match self.get_execution_state(execution_id).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(execution_id = %execution_id, error = %e, "Failed to read execution state");
                        None
                    }
                };
                let Some(mut snapshot) = stored.filter(|s| !s.state.is_terminal()) else {
                    return false;
                };
                snapshot.finish(
                    ExecutionState::Cancelled,
                    Some(WeftError::Cancelled.to_string()),
                );
                self.persist_snapshot(&snapshot).await;
            }
        }

        self.emit(
            EXECUTION_CANCELLED,
            execution_id,
            json!({"execution_id": execution_id}),
        )
        .await;
        info!(execution_id = %execution_id, "Execution cancelled");
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Run the agent on its own task so a panic inside it becomes a Failed
/// outcome.
async fn run_spawned(
    agent: Arc<Agent>,
    task: &str,
    context: &Context,
    cancel: CancellationToken,
) -> AgentOutcome {
    let task = task.to_string();
    let context = context.clone();
    let handle = tokio::spawn(async move { agent.execute(&task, &context, &cancel).await });
    let _abort = AbortOnDrop(handle.abort_handle());

    match handle.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            error!("Agent task panicked");
            AgentOutcome::failed("Agent panicked", 0, Usage::default())
        }
        Err(e) => AgentOutcome::failed(format!("Agent task aborted: {}", e), 0, Usage::default()),
    }
}
