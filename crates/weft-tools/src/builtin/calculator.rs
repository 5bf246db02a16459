use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::expr;
use weft_core::traits::Tool;
use weft_core::types::Context;

/// Arithmetic over the sandboxed expression language. No names are in
/// scope, so only literals and operators evaluate.
pub struct CalculatorTool;

#[derive(Deserialize)]
struct CalculatorInput {
    expression: String,
}

impl Tool for CalculatorTool {
    fn id(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Perform basic arithmetic operations"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Mathematical expression to evaluate (e.g. \"2 + 2 * 3\")"
                }
            },
            "required": ["expression"]
        })
    }

    fn execute(&self, args: Context) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: CalculatorInput = serde_json::from_value(serde_json::Value::Object(args))
                .map_err(|e| WeftError::InvalidArguments(e.to_string()))?;
            debug!(expression = %params.expression, "Evaluating");

            let value = expr::evaluate(&params.expression, &Context::new()).map_err(|e| {
                WeftError::ToolExecution {
                    tool: "calculator".to_string(),
                    message: format!("Invalid expression: {}", e),
                }
            })?;
            let n = value.as_f64().ok_or_else(|| WeftError::ToolExecution {
                tool: "calculator".to_string(),
                message: format!("Expression did not produce a number: {}", value),
            })?;
            Ok(serde_json::json!(n))
        })
    }
}
