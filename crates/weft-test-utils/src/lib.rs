//! Mocks and fixtures shared by weft's test suites.

mod llm;
mod tools;

pub use llm::ScriptedLlm;
pub use tools::{FailingTool, FlakyTool, RecordingTool, SlowTool, StaticTool};

use std::path::PathBuf;

use weft_core::types::Context;
use weft_core::workflow::AgentDefinition;

/// Build a [`Context`] from a JSON object literal.
pub fn ctx(value: serde_json::Value) -> Context {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Context::new(),
    }
}

/// Agent definition with a short prompt and the given tools.
pub fn agent_def(id: &str, tools: &[&str]) -> AgentDefinition {
    AgentDefinition::new(id, format!("You are {}.", id)).with_tools(tools)
}

/// Write `content` into a fresh temp dir and return (dir guard, file path).
pub fn write_temp_file(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("write temp file");
    (dir, path)
}
