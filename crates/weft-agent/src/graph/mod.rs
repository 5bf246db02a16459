//! Dependency-graph workflow execution.

pub mod dependency;
pub mod engine;
pub mod input;
pub mod retry;

pub use dependency::DependencyGraph;
pub use engine::{HumanInLoopHook, WorkflowEngine};
pub use retry::calculate_backoff;
