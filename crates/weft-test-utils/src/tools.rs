use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Tool;
use weft_core::types::Context;

fn schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Returns a fixed value and records every argument map it receives.
pub struct StaticTool {
    id: String,
    value: serde_json::Value,
    calls: Mutex<Vec<Context>>,
}

impl StaticTool {
    pub fn new(id: &str, value: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            value,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Context> {
        self.calls.lock().unwrap().clone()
    }
}

impl Tool for StaticTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Returns a fixed value"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    fn execute(&self, args: Context) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(args);
            Ok(self.value.clone())
        })
    }
}

/// Echoes its arguments back as an object.
pub struct RecordingTool {
    id: String,
    calls: Mutex<Vec<Context>>,
}

impl RecordingTool {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Context> {
        self.calls.lock().unwrap().clone()
    }
}

impl Tool for RecordingTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Echoes its arguments"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    fn execute(&self, args: Context) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(args.clone());
            Ok(serde_json::Value::Object(args))
        })
    }
}

/// Always fails.
pub struct FailingTool {
    id: String,
    message: String,
    attempts: AtomicUsize,
}

impl FailingTool {
    pub fn new(id: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            message: message.to_string(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Tool for FailingTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    fn execute(&self, _args: Context) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(WeftError::ToolExecution {
                tool: self.id.clone(),
                message: self.message.clone(),
            })
        })
    }
}

/// Fails a fixed number of times, then succeeds.
pub struct FlakyTool {
    id: String,
    failures: usize,
    value: serde_json::Value,
    attempts: AtomicUsize,
}

impl FlakyTool {
    pub fn new(id: &str, failures: usize, value: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            failures,
            value,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Tool for FlakyTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Fails a few times before succeeding"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    fn execute(&self, _args: Context) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(WeftError::ToolExecution {
                    tool: self.id.clone(),
                    message: format!("transient failure {}", n + 1),
                });
            }
            Ok(self.value.clone())
        })
    }
}

/// Sleeps before answering.
pub struct SlowTool {
    id: String,
    delay: Duration,
    value: serde_json::Value,
    timeout_secs: u64,
}

impl SlowTool {
    pub fn new(id: &str, delay: Duration, value: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            delay,
            value,
            timeout_secs: 30,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Tool for SlowTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Answers after a delay"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn execute(&self, _args: Context) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(self.value.clone())
        })
    }
}
