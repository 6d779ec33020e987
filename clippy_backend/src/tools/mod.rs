//! Tools the model can call while composing a reply.
//!
//! Each tool declares a JSON Schema for its parameters, enabling LLM
//! function-calling. Tools are registered in a thread-safe ToolRegistry that
//! generates OpenAI-format function definitions for the LLM. Calls to names
//! nobody registered resolve to [`UnsupportedTool`], so the conversation
//! always gets a result turn back.

pub mod agentic;
pub mod forum_search;
pub mod image_gen;
pub mod memory;
pub mod search;
pub mod vision;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::deferred::DeferredSender;
use crate::error::ToolError;
use crate::memory::MemoryStore;

/// Category of tool, used for logging and grouping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCategory {
    /// Web and forum lookups
    Network,
    /// Persistent memory blob
    Memory,
    /// Image generation and inspection
    Media,
    General,
}

/// The result of executing a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
    /// Tool execution failed
    Error(String),
}

impl ToolOutput {
    /// Convert to a string representation suitable for feeding back to the LLM
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ToolOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    /// Returns true if this output represents success (Text or Json)
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Text(_) | ToolOutput::Json(_))
    }
}

/// Per-conversation context passed to tools.
#[derive(Clone, Default)]
pub struct ToolContext {
    /// The bot's forum username
    pub username: String,
    /// Topic the conversation is replying in
    pub topic_id: Option<i64>,
    /// Post that triggered the conversation
    pub post_id: Option<i64>,
    /// Where background work drops finished side effects
    pub deferred: Option<DeferredSender>,
    pub memory: Option<Arc<MemoryStore>>,
}

/// A capability the model can invoke during a conversation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g., "search", "generate_image")
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    ///
    /// Example:
    /// ```json
    /// {
    ///   "type": "object",
    ///   "properties": {
    ///     "query": { "type": "string", "description": "What to search for" }
    ///   },
    ///   "required": ["query"]
    /// }
    /// ```
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with already-validated parameters.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput>;

    /// Check arguments against the declared schema: required keys present and
    /// primitive types matching.
    fn validate_args(&self, args: &Value) -> Result<(), ToolError> {
        validate_against_schema(self.name(), &self.parameters_schema(), args)
    }

    /// Category for grouping and logging
    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }
}

pub fn validate_against_schema(tool: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
    let invalid = |reason: String| ToolError::ArgumentInvalid {
        tool: tool.to_string(),
        reason,
    };

    let Some(object) = args.as_object() else {
        return Err(invalid(format!("arguments must be a JSON object, got {}", args)));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match object.get(key) {
                None | Some(Value::Null) => {
                    return Err(invalid(format!("missing required parameter '{}'", key)))
                }
                Some(_) => {}
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in object {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let matches = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(invalid(format!(
                    "parameter '{}' must be of type {}, got {}",
                    key, expected, value
                )));
            }
        }
    }

    Ok(())
}

/// Stand-in for tool names the model invented.
pub struct UnsupportedTool {
    name: String,
}

impl UnsupportedTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Tool for UnsupportedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Placeholder for an unknown tool"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn validate_args(&self, _args: &Value) -> Result<(), ToolError> {
        Ok(())
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        Ok(ToolOutput::Error(format!(
            "Tool '{}' not recognized",
            self.name
        )))
    }
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// A tool call with parsed arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Result of a tool call, ready to feed back to the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub name: String,
    pub output: ToolOutput,
}

/// Thread-safe registry of tools available to the model.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!(
            "Registered tool: {} (category: {:?})",
            name,
            tool.category()
        );
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Look a tool up, falling back to [`UnsupportedTool`].
    pub async fn resolve(&self, name: &str) -> Arc<dyn Tool> {
        match self.get(name).await {
            Some(tool) => tool,
            None => {
                tracing::warn!("Model called unknown tool '{}'", name);
                Arc::new(UnsupportedTool::new(name))
            }
        }
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// OpenAI-format tool definitions, sorted by name for stable prompts.
    pub async fn tool_definitions(&self) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDef> = tools
            .values()
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Resolve, validate and execute one call. Never fails: problems come
    /// back as `ToolOutput::Error` for the model to read.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        let tool = self.resolve(&call.name).await;

        if let Err(e) = tool.validate_args(&call.arguments) {
            return ToolCallResult {
                name: call.name.clone(),
                output: ToolOutput::Error(e.to_string()),
            };
        }

        let output = match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => output,
            Err(e) => {
                let error = ToolError::ExecutionFailed {
                    tool: call.name.clone(),
                    reason: format!("{:#}", e),
                };
                tracing::warn!("{}", error);
                ToolOutput::Error(error.to_string())
            }
        };

        ToolCallResult {
            name: call.name.clone(),
            output,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
