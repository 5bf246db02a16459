pub mod agent_loop;
pub mod graph;
pub mod orchestrator;
pub mod pool;

pub use agent_loop::Agent;
pub use graph::{DependencyGraph, HumanInLoopHook, WorkflowEngine};
pub use orchestrator::{CoordinationPattern, ExecutionSnapshot, Orchestrator};
pub use pool::AgentPool;
