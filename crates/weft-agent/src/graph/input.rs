//! Task input resolution.
//!
//! A string input of the form `$name` or `$name.key.0` is a reference.
//! When `name` is a task id it reads that task's recorded result,
//! otherwise the workflow input called `name`. `$$` at the start escapes a
//! literal dollar sign. Everything else is passed through unchanged.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use weft_core::types::Context;

/// What a task's inputs are resolved against.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub inputs: &'a Context,
    pub results: &'a HashMap<String, Value>,
    pub task_ids: &'a HashSet<String>,
}

/// A reference that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingInput {
    pub input: String,
    pub reference: String,
}

/// Resolved values plus the inputs whose references were missing. Missing
/// inputs are left out of `values`; the task body decides whether that is
/// fatal.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    pub values: Context,
    pub missing: Vec<MissingInput>,
}

impl ResolvedInputs {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

pub fn resolve_inputs(declared: &Context, scope: &Scope<'_>) -> ResolvedInputs {
    let mut out = ResolvedInputs::default();
    for (name, value) in declared {
        match resolve_value(value, scope) {
            Some(v) => {
                out.values.insert(name.clone(), v);
            }
            None => out.missing.push(MissingInput {
                input: name.clone(),
                reference: value.as_str().unwrap_or_default().to_string(),
            }),
        }
    }
    out
}

/// Resolve one declared value. `None` means an unresolvable reference.
pub fn resolve_value(value: &Value, scope: &Scope<'_>) -> Option<Value> {
    let Value::String(s) = value else {
        return Some(value.clone());
    };
    if let Some(escaped) = s.strip_prefix("$$") {
        return Some(Value::String(format!("${}", escaped)));
    }
    match parse_reference(s) {
        Some(path) => lookup(&path, scope),
        None => Some(value.clone()),
    }
}

/// Split `$a.b.c` into its segments. Anything that is not a well-formed
/// reference is a literal.
fn parse_reference(s: &str) -> Option<Vec<&str>> {
    let body = s.strip_prefix('$')?;
    let segments: Vec<&str> = body.split('.').collect();
    let valid = segments.iter().all(|seg| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    });
    let head_ok = segments
        .first()
        .and_then(|h| h.chars().next())
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    (valid && head_ok).then_some(segments)
}

fn lookup(path: &[&str], scope: &Scope<'_>) -> Option<Value> {
    let (head, rest) = path.split_first()?;
    let root = if scope.task_ids.contains(*head) {
        scope.results.get(*head)?
    } else {
        scope.inputs.get(*head)?
    };
    let mut current = root;
    for seg in rest {
        current = match current {
            Value::Object(map) => map.get(*seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
