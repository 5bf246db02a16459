use std::collections::{HashMap, HashSet};

use weft_core::error::{Result, WeftError};
use weft_core::workflow::WorkflowDefinition;

/// Forward and reverse dependency maps over a fixed, ordered task set.
///
/// Readiness is computed from the forward map alone. The reverse map only
/// answers "what is downstream of this task".
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<String>,
    forward: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph. Every id used in `dependencies`, as a key or as a
    /// predecessor, must be one of `task_ids`.
    pub fn new(task_ids: Vec<String>, dependencies: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut known = HashSet::new();
        for id in &task_ids {
            if !known.insert(id.as_str()) {
                return Err(WeftError::DuplicateTask(id.clone()));
            }
        }

        let mut forward: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        for (task, deps) in dependencies {
            if !known.contains(task.as_str()) {
                return Err(WeftError::UnknownTask(task.clone()));
            }
            for dep in deps {
                if !known.contains(dep.as_str()) {
                    return Err(WeftError::UnknownDependency {
                        task: task.clone(),
                        dependency: dep.clone(),
                    });
                }
                reverse.entry(dep.clone()).or_default().push(task.clone());
            }
            forward.insert(task.clone(), deps.clone());
        }
        for dependents in reverse.values_mut() {
            dependents.sort();
        }

        Ok(Self {
            order: task_ids,
            forward,
            reverse,
        })
    }

    /// Graph over a workflow's scheduled tasks. Fallback and loop-body tasks
    /// are left out; they only run on behalf of another task.
    pub fn from_workflow(definition: &WorkflowDefinition) -> Result<Self> {
        let detached = definition.detached_task_ids();
        let ids = definition
            .tasks
            .iter()
            .filter(|t| !detached.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();
        Self::new(ids, &definition.dependencies)
    }

    /// Tasks not in `completed` whose dependencies all are, in task order.
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter(|id| {
                self.dependencies_of(id)
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    pub fn dependencies_of(&self, task_id: &str) -> &[String] {
        self.forward.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents_of(&self, task_id: &str) -> &[String] {
        self.reverse.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every task transitively downstream of `task_id`, sorted.
    pub fn downstream_of(&self, task_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![task_id];
        while let Some(id) = stack.pop() {
            for next in self.dependents_of(id) {
                if seen.insert(next.as_str()) {
                    stack.push(next);
                }
            }
        }
        let mut out: Vec<String> = seen.into_iter().map(str::to_string).collect();
        out.sort();
        out
    }

    /// Readiness rounds assuming every task succeeds. A graph that stops
    /// making progress is reported with the tasks left over.
    pub fn plan(&self) -> Result<Vec<Vec<String>>> {
        let mut done = HashSet::new();
        let mut rounds = Vec::new();
        while done.len() < self.order.len() {
            let ready = self.ready_tasks(&done);
            if ready.is_empty() {
                let pending: Vec<&str> = self
                    .order
                    .iter()
                    .filter(|id| !done.contains(*id))
                    .map(String::as_str)
                    .collect();
                return Err(WeftError::InvalidWorkflow(format!(
                    "stuck: circular or missing dependency among {}",
                    pending.join(", ")
                )));
            }
            done.extend(ready.iter().cloned());
            rounds.push(ready);
        }
        Ok(rounds)
    }

    pub fn task_ids(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.order.iter().any(|id| id == task_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
