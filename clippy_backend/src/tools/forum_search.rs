//! `search_forum`: keyword search over crawled forum comments.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{Tool, ToolCategory, ToolContext, ToolOutput};
use crate::store::ForumStore;

const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 20;

pub struct ForumSearchTool {
    store: Arc<ForumStore>,
}

impl ForumSearchTool {
    pub fn new(store: Arc<ForumStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ForumSearchTool {
    fn name(&self) -> &str {
        "search_forum"
    }

    fn description(&self) -> &str {
        "Search recent forum comments by keywords. Use it to find what people said about a \
         subject in other topics."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Keywords to look for"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of comments to return (1-20, default 5)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|v| (v as usize).clamp(1, MAX_LIMIT))
            .unwrap_or(DEFAULT_LIMIT);

        let docs = self.store.search(query, limit)?;
        if docs.is_empty() {
            return Ok(ToolOutput::Text(format!(
                "No forum comments found for '{}'",
                query
            )));
        }

        Ok(ToolOutput::Json(json!({
            "query": query,
            "matches": docs.iter().map(|doc| json!({
                "topic_id": doc.topic_id,
                "post_id": doc.post_id,
                "text": doc.text,
            })).collect::<Vec<_>>()
        })))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }
}
