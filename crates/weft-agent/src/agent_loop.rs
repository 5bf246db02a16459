use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::error::WeftError;
use weft_core::traits::{LlmBackend, MemoryProvider};
use weft_core::types::*;
use weft_core::workflow::AgentDefinition;
use weft_tools::ToolRegistry;

/// A single agent: one system prompt, one model, and the tools it may call.
///
/// `execute` runs the LLM/tool-call loop until the model answers without
/// requesting tools, the iteration budget runs out, or the run is cancelled.
/// It never returns an error; failures are reported in the [`AgentOutcome`].
pub struct Agent {
    definition: AgentDefinition,
    llm: Arc<dyn LlmBackend>,
    tools: ToolRegistry,
    memory: Option<Arc<dyn MemoryProvider>>,
}

impl Agent {
    /// Build an agent whose tool set is the subset of `tools` named in the
    /// definition.
    pub fn new(definition: AgentDefinition, llm: Arc<dyn LlmBackend>, tools: &ToolRegistry) -> Self {
        let tools = tools.subset(&definition.tools);
        Self {
            definition,
            llm,
            tools,
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn tool_ids(&self) -> Vec<&str> {
        self.tools.list()
    }

    pub async fn execute(
        &self,
        task: &str,
        context: &Context,
        cancel: &CancellationToken,
    ) -> AgentOutcome {
        let agent_id = self.id();
        let max_iterations = self.definition.max_iterations;
        let tool_defs = self.tools.definitions();
        let mut messages = self.build_messages(task, context).await;
        let mut usage = Usage::default();

        info!(agent_id = %agent_id, max_iterations, "Agent run started");

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                info!(agent_id = %agent_id, iteration, "Agent run cancelled");
                return AgentOutcome::cancelled(iteration - 1, usage);
            }

            let request = LlmRequest {
                messages: messages.clone(),
                model: self.definition.model.clone(),
                temperature: self.definition.temperature,
                tools: tool_defs.clone(),
            };

            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(agent_id = %agent_id, iteration, "Agent run cancelled during LLM call");
                    return AgentOutcome::cancelled(iteration - 1, usage);
                }
                r = self.llm.generate(request) => r,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    error!(agent_id = %agent_id, iteration, error = %e, "LLM call failed");
                    return AgentOutcome::failed(e.to_string(), iteration, usage);
                }
            };
            if let Some(u) = &response.usage {
                usage.add(u);
            }

            if response.tool_calls.is_empty() {
                debug!(agent_id = %agent_id, iteration, "Agent produced final answer");
                self.remember(task, &response.content, context).await;
                return AgentOutcome::completed(response.content, iteration, usage);
            }

            messages.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                let output = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(agent_id = %agent_id, tool = %call.function.name, "Agent run cancelled during tool call");
                        return AgentOutcome::cancelled(iteration, usage);
                    }
                    out = self.run_tool(call) => out,
                };
                messages.push(ChatMessage::tool_result(
                    call.id.clone(),
                    call.function.name.clone(),
                    output,
                ));
            }
        }

        warn!(agent_id = %agent_id, max_iterations, "Agent hit iteration limit");
        AgentOutcome::failed(
            WeftError::MaxIterationsExceeded(max_iterations).to_string(),
            max_iterations,
            usage,
        )
    }

    async fn build_messages(&self, task: &str, context: &Context) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.definition.system_prompt.clone())];

        if let Some(memory) = &self.memory {
            match memory.retrieve_relevant(task, context).await {
                Ok(Some(recalled)) => messages.push(ChatMessage::system(format!(
                    "Relevant context from memory:\n{}",
                    recalled
                ))),
                Ok(None) => {}
                Err(e) => warn!(agent_id = %self.id(), error = %e, "Memory recall failed"),
            }
        }

        messages.push(ChatMessage::user(user_message(task, context)));
        messages
    }

    async fn run_tool(&self, call: &ToolCall) -> String {
        let name = &call.function.name;
        let args = match call.arguments() {
            Ok(args) => args,
            Err(e) => return format!("Error: {}", e),
        };
        debug!(agent_id = %self.id(), tool = %name, "Executing tool call");

        match self.tools.execute(name, args).await {
            Ok(serde_json::Value::String(s)) => s,
            Ok(value) => value.to_string(),
            Err(WeftError::ToolNotFound(_)) => format!("Tool {} not found", name),
            Err(e) => {
                warn!(agent_id = %self.id(), tool = %name, error = %e, "Tool call failed");
                format!("Error: {}", e)
            }
        }
    }

    async fn remember(&self, task: &str, response: &str, context: &Context) {
        if let Some(memory) = &self.memory {
            if let Err(e) = memory.store_interaction(task, response, context).await {
                warn!(agent_id = %self.id(), error = %e, "Failed to store interaction");
            }
        }
    }
}

/// The task followed by a `key: value` rendering of the context. The
/// `task` key itself is not repeated.
fn user_message(task: &str, context: &Context) -> String {
    let lines: Vec<String> = context
        .iter()
        .filter(|(k, _)| k.as_str() != "task")
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => format!("{}: {}", k, s),
            other => format!("{}: {}", k, other),
        })
        .collect();

    if lines.is_empty() {
        task.to_string()
    } else {
        format!("{}\n\nContext:\n{}", task, lines.join("\n"))
    }
}
