//! Tools that edit the persistent memory blob.
//!
//! - `memory_append`: add a line to the blob.
//! - `memory_replace`: rewrite the whole blob.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolCategory, ToolContext, ToolOutput};
use crate::memory::MemoryStore;

fn memory_from(ctx: &ToolContext) -> Result<&MemoryStore> {
    ctx.memory
        .as_deref()
        .context("persistent memory is not available in this conversation")
}

fn text_param(params: &Value) -> &str {
    params.get("text").and_then(Value::as_str).unwrap_or_default()
}

pub struct MemoryAppendTool;

#[async_trait]
impl Tool for MemoryAppendTool {
    fn name(&self) -> &str {
        "memory_append"
    }

    fn description(&self) -> &str {
        "Append a note to your persistent memory. Memory is shown to you at the start of \
         every conversation, so store facts worth remembering about users and the forum."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The note to add"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let text = text_param(&params).trim();
        if text.is_empty() {
            return Ok(ToolOutput::Error("Refusing to append an empty note".to_string()));
        }
        let memory = memory_from(ctx)?;
        memory.append(text).context("failed to persist memory")?;
        tracing::info!("Memory appended ({} chars total)", memory.char_len());
        Ok(ToolOutput::Text("memory updated".to_string()))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Memory
    }
}

pub struct MemoryReplaceTool;

#[async_trait]
impl Tool for MemoryReplaceTool {
    fn name(&self) -> &str {
        "memory_replace"
    }

    fn description(&self) -> &str {
        "Replace your entire persistent memory with new text. Use it to reorganize or \
         correct what you remember; anything left out is forgotten."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The complete new memory contents"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let memory = memory_from(ctx)?;
        memory
            .replace(text_param(&params))
            .context("failed to persist memory")?;
        tracing::info!("Memory replaced ({} chars)", memory.char_len());
        Ok(ToolOutput::Text("memory replaced".to_string()))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Memory
    }
}
