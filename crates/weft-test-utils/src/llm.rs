use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::LlmBackend;
use weft_core::types::{LlmRequest, LlmResponse, ToolCall, Usage};

/// LLM backend that replays a queue of canned responses.
///
/// Every request is recorded. Once the queue is empty, the fallback
/// response (default "done") is returned for every further call.
pub struct ScriptedLlm {
    queue: Mutex<VecDeque<Result<LlmResponse>>>,
    fallback: Mutex<Option<LlmResponse>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Some(LlmResponse::text("done"))),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(self, item: Result<LlmResponse>) -> Self {
        self.queue.lock().unwrap().push_back(item);
        self
    }

    pub fn with_response(self, response: LlmResponse) -> Self {
        self.push(Ok(response))
    }

    pub fn with_text(self, text: &str) -> Self {
        self.push(Ok(LlmResponse::text(text)))
    }

    pub fn with_usage_text(self, text: &str, usage: Usage) -> Self {
        self.push(Ok(LlmResponse {
            content: text.to_string(),
            tool_calls: vec![],
            usage: Some(usage),
        }))
    }

    /// Queue a single tool call request.
    pub fn with_tool_call(self, id: &str, tool: &str, arguments: serde_json::Value) -> Self {
        self.push(Ok(LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall::new(id, tool, arguments)],
            usage: None,
        }))
    }

    pub fn with_error(self, message: &str) -> Self {
        self.push(Err(WeftError::Llm(message.to_string())))
    }

    /// Error once the queue is exhausted instead of answering "done".
    pub fn strict(self) -> Self {
        *self.fallback.lock().unwrap() = None;
        self
    }

    /// Keep answering with tool calls forever, e.g. to exhaust max_iterations.
    pub fn looping_tool_call(self, tool: &str, arguments: serde_json::Value) -> Self {
        *self.fallback.lock().unwrap() = Some(LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall::new("loop", tool, arguments)],
            usage: None,
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmBackend for ScriptedLlm {
    fn generate(&self, request: LlmRequest) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(item) => item,
                None => self
                    .fallback
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| WeftError::Llm("script exhausted".into())),
            }
        })
    }
}
