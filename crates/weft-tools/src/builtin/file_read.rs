use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Tool;
use weft_core::types::Context;

pub struct FileReadTool;

#[derive(Deserialize)]
struct FileReadInput {
    file_path: String,
    #[serde(default)]
    max_bytes: Option<usize>,
}

const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

impl Tool for FileReadTool {
    fn id(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a UTF-8 text file"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to read"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Truncate the contents after this many bytes (default: 1 MiB)"
                }
            },
            "required": ["file_path"]
        })
    }

    fn execute(&self, args: Context) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: FileReadInput = serde_json::from_value(serde_json::Value::Object(args))
                .map_err(|e| WeftError::InvalidArguments(e.to_string()))?;
            debug!(path = %params.file_path, "Reading file");

            let mut content = tokio::fs::read_to_string(&params.file_path)
                .await
                .map_err(|e| WeftError::ToolExecution {
                    tool: "file_read".to_string(),
                    message: format!("Error reading file {}: {}", params.file_path, e),
                })?;

            let limit = params.max_bytes.unwrap_or(DEFAULT_MAX_BYTES);
            if content.len() > limit {
                let mut cut = limit;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
            Ok(serde_json::Value::String(content))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_test_utils::{ctx, write_temp_file};

    #[tokio::test]
    async fn reads_file() {
        let (_dir, path) = write_temp_file("notes.txt", "hello weft");
        let out = FileReadTool
            .execute(ctx(serde_json::json!({"file_path": path.display().to_string()})))
            .await
            .unwrap();
        assert_eq!(out, "hello weft");
    }

    #[tokio::test]
    async fn truncates_on_char_boundary() {
        let (_dir, path) = write_temp_file("u.txt", "héllo");
        let out = FileReadTool
            .execute(ctx(serde_json::json!({"file_path": path.display().to_string(), "max_bytes": 2})))
            .await
            .unwrap();
        assert_eq!(out, "h");
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let err = FileReadTool
            .execute(ctx(serde_json::json!({"file_path": "/definitely/not/here.txt"})))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::ToolExecution { .. }));
    }
}
