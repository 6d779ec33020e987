use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::AgentConfig;
use crate::error::ModelError;
use crate::http_client::build_http_client;
use crate::tools::ToolDef;

/// A conversation turn in OpenAI chat format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn requested_tool_calls(&self) -> &[LlmToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

/// Tool call as returned by the LLM (OpenAI format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmFunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the model produced it.
    pub arguments: String,
}

/// Anything that can answer a chat-completion request.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[Message], tools: &[ToolDef])
        -> Result<Message, ModelError>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String, max_tokens: u32) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            max_tokens,
            client: build_http_client(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.llm_max_tokens,
        )
    }

    /// Same endpoint and credentials, different model.
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post_completion(&self, body: &Value) -> Result<Value, ModelError> {
        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(&url).json(body);

        // Local OpenAI-compatible servers don't need a key.
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::RequestFailed { status, body });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ModelError::InvalidResponse(format!("body is not JSON: {}", e)))
    }

    /// Ask the vision model a question about a JPEG image.
    pub async fn describe_image(
        &self,
        jpeg_bytes: &[u8],
        question: &str,
    ) -> Result<String, ModelError> {
        let image_base64 = base64::engine::general_purpose::STANDARD.encode(jpeg_bytes);
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": question },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{}", image_base64) }
                    }
                ]
            }]
        });

        let response = self.post_completion(&body).await?;
        let message = parse_completion(&response)?;
        message
            .content
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ModelError::InvalidResponse("vision model returned no text".to_string()))
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<Message, ModelError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
        });

        // Only include tools if we have any
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)
                .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        }

        let response = self.post_completion(&body).await?;
        parse_completion(&response)
    }
}

/// Pull the assistant message out of a chat-completions response.
pub fn parse_completion(response: &Value) -> Result<Message, ModelError> {
    let choice = response["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or_else(|| {
            let detail = response
                .get("error")
                .map(Value::to_string)
                .unwrap_or_else(|| "empty choices".to_string());
            ModelError::InvalidResponse(detail)
        })?;

    let message = &choice["message"];
    let content = message["content"].as_str().map(String::from);

    let tool_calls = match message.get("tool_calls") {
        Some(Value::Array(calls)) if !calls.is_empty() => Some(
            calls
                .iter()
                .enumerate()
                .map(|(idx, call)| parse_tool_call(idx, call))
                .collect(),
        ),
        _ => None,
    };

    Ok(Message {
        role: "assistant".to_string(),
        content,
        tool_calls,
        tool_call_id: None,
    })
}

/// Read one tool call without rejecting sloppy servers: `arguments` may be an
/// object instead of a string, `id` and `type` may be missing. Bad argument
/// text is kept as-is so the engine can report it back to the model.
fn parse_tool_call(idx: usize, call: &Value) -> LlmToolCall {
    let function = &call["function"];
    let arguments = match &function["arguments"] {
        Value::String(text) if text.trim().is_empty() => "{}".to_string(),
        Value::String(text) => text.clone(),
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    };

    LlmToolCall {
        id: call["id"]
            .as_str()
            .filter(|id| !id.trim().is_empty())
            .map(String::from)
            .unwrap_or_else(|| format!("tool_call_{}", idx)),
        call_type: call["type"]
            .as_str()
            .filter(|t| !t.trim().is_empty())
            .map(String::from)
            .unwrap_or_else(default_call_type),
        function: LlmFunctionCall {
            name: function["name"].as_str().unwrap_or_default().to_string(),
            arguments,
        },
    }
}

/// Remove `<think>`/`<thinking>` blocks some models emit before the answer.
pub fn strip_thinking(input: &str) -> String {
    fn strip_tag(mut text: String, open_tag: &str, close_tag: &str) -> String {
        while let Some(start) = text.find(open_tag) {
            let content_start = start + open_tag.len();
            match text[content_start..].find(close_tag) {
                Some(rel_end) => {
                    let remove_end = content_start + rel_end + close_tag.len();
                    text.replace_range(start..remove_end, "");
                }
                None => text.truncate(start),
            }
        }
        text
    }

    let text = strip_tag(input.to_string(), "<thinking>", "</thinking>");
    strip_tag(text, "<think>", "</think>").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_value(Message::user("Hello")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "Hello");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn test_tool_result_message_serialization() {
        let json = serde_json::to_value(Message::tool_result("call_123", "ok")).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_123");
    }

    #[test]
    fn parses_text_completion() {
        let response = json!({
            "choices": [{ "message": { "role": "assistant", "content": "Hi there" } }]
        });
        let message = parse_completion(&response).unwrap();
        assert_eq!(message.content.as_deref(), Some("Hi there"));
        assert!(message.requested_tool_calls().is_empty());
    }

    #[test]
    fn parses_tool_call_completion() {
        let response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "search", "arguments": "{\"query\":\"rust\"}" }
                    }]
                }
            }]
        });
        let message = parse_completion(&response).unwrap();
        assert!(message.content.is_none());
        let calls = message.requested_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "search");
    }

    #[test]
    fn tolerates_object_arguments_and_missing_ids() {
        let response = json!({
            "choices": [{
                "message": {
                    "tool_calls": [
                        { "function": { "name": "search", "arguments": { "query": "rust" } } },
                        { "id": "", "function": { "name": "memory_append", "arguments": "" } },
                        { "id": "c3", "function": { "name": "search", "arguments": "{not json" } }
                    ]
                }
            }]
        });
        let message = parse_completion(&response).unwrap();
        let calls = message.requested_tool_calls();
        assert_eq!(calls.len(), 3);

        assert_eq!(calls[0].id, "tool_call_0");
        assert_eq!(calls[0].call_type, "function");
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["query"], "rust");

        assert_eq!(calls[1].id, "tool_call_1");
        assert_eq!(calls[1].function.arguments, "{}");

        assert_eq!(calls[2].id, "c3");
        assert_eq!(calls[2].function.arguments, "{not json");
    }

    #[test]
    fn empty_choices_are_invalid() {
        let err = parse_completion(&json!({"error": {"message": "rate limited"}})).unwrap_err();
        assert!(matches!(err, ModelError::InvalidResponse(_)));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn strips_thinking_blocks() {
        assert_eq!(strip_thinking("<think>internal</think>\nHello there"), "Hello there");
        assert_eq!(
            strip_thinking("<thinking>plan</thinking>\n<think>detail</think>\nDone"),
            "Done"
        );
        assert_eq!(strip_thinking("Answer <think>unterminated"), "Answer");
    }

    #[test]
    fn empty_api_key_is_ignored() {
        let client = LlmClient::new(
            "https://llm.example/v1/".to_string(),
            Some("  ".to_string()),
            "model".to_string(),
            100,
        );
        assert!(client.api_key.is_none());
        assert_eq!(client.api_url, "https://llm.example/v1");
        assert_eq!(client.with_model("vision").model(), "vision");
    }
}
