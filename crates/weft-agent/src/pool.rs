use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use weft_core::traits::LlmBackend;
use weft_core::workflow::AgentDefinition;
use weft_memory::ShortTermMemory;
use weft_tools::ToolRegistry;

use crate::agent_loop::Agent;

/// Registry of agents available to an orchestrator.
///
/// Owned by whoever builds the orchestrator; there is no process-wide pool.
#[derive(Default)]
pub struct AgentPool {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Agent>>> {
        match self.agents.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Agent>>> {
        match self.agents.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register an agent, replacing any agent with the same id.
    pub fn register(&self, agent: Agent) -> Arc<Agent> {
        let agent = Arc::new(agent);
        let id = agent.id().to_string();
        if self.write().insert(id.clone(), agent.clone()).is_some() {
            info!(agent_id = %id, "Replaced registered agent");
        } else {
            debug!(agent_id = %id, "Registered agent");
        }
        agent
    }

    /// Build an agent from its definition and register it. Short-term
    /// memory is attached when the definition enables it.
    pub fn create(
        &self,
        definition: AgentDefinition,
        llm: Arc<dyn LlmBackend>,
        tools: &ToolRegistry,
    ) -> Arc<Agent> {
        let memory = definition.memory.clone();
        let mut agent = Agent::new(definition, llm, tools);
        if memory.short_term_enabled {
            agent = agent.with_memory(Arc::new(ShortTermMemory::new(memory.max_entries)));
        }
        self.register(agent)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.read().get(agent_id).cloned()
    }

    pub fn definition(&self, agent_id: &str) -> Option<AgentDefinition> {
        self.read().get(agent_id).map(|a| a.definition().clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.read().contains_key(agent_id)
    }

    /// Registered agent ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn remove(&self, agent_id: &str) -> bool {
        self.write().remove(agent_id).is_some()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
