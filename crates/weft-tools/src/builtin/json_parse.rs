use futures::future::BoxFuture;
use serde::Deserialize;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Tool;
use weft_core::types::Context;

pub struct JsonParseTool;

#[derive(Deserialize)]
struct JsonParseInput {
    json_string: String,
}

impl Tool for JsonParseTool {
    fn id(&self) -> &str {
        "json_parse"
    }

    fn description(&self) -> &str {
        "Parse a JSON string into a structured value"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json_string": {
                    "type": "string",
                    "description": "JSON string to parse"
                }
            },
            "required": ["json_string"]
        })
    }

    fn execute(&self, args: Context) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: JsonParseInput = serde_json::from_value(serde_json::Value::Object(args))
                .map_err(|e| WeftError::InvalidArguments(e.to_string()))?;
            serde_json::from_str(&params.json_string).map_err(|e| WeftError::ToolExecution {
                tool: "json_parse".to_string(),
                message: format!("Invalid JSON: {}", e),
            })
        })
    }
}
