//! Tool-calling conversation loop.
//!
//! 1. Send the turns plus tool definitions to the model
//! 2. If the model asks for tools, run each one and append a `tool` turn per call
//! 3. Nudge the model for its reply and go again
//! 4. Stop on a plain text answer or when the iteration budget runs out
//!
//! Nothing here fails the conversation except the model itself: bad
//! arguments, unknown tools and tool errors all become tool turns.

use serde_json::Value;
use std::sync::Arc;

use super::{ToolCall, ToolContext, ToolOutput, ToolRegistry};
use crate::error::ToolError;
use crate::llm_client::{strip_thinking, ChatModel, Message};

/// Posted when no usable answer came out of the model.
pub const FALLBACK_REPLY: &str = "Error generating response";

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

const STEERING_PROMPT: &str =
    "Using the tool results above, write your reply to the conversation now.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Final,
    IterationExhausted,
    ModelFailed,
}

/// Record of a tool call made during the loop
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub output: ToolOutput,
}

#[derive(Debug, Clone)]
pub struct ConversationOutcome {
    /// Text to post. Never empty.
    pub answer: String,
    pub iterations: usize,
    pub status: ConversationStatus,
    pub tool_calls_made: Vec<ToolCallRecord>,
}

pub struct ConversationEngine {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    max_iterations: usize,
}

impl ConversationEngine {
    pub fn new(model: Arc<dyn ChatModel>, registry: Arc<ToolRegistry>, max_iterations: usize) -> Self {
        Self {
            model,
            registry,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub async fn run(&self, mut messages: Vec<Message>, ctx: &ToolContext) -> ConversationOutcome {
        let tool_defs = self.registry.tool_definitions().await;
        let mut tool_calls_made = Vec::new();

        for iteration in 1..=self.max_iterations {
            tracing::debug!("Conversation iteration {} - calling LLM", iteration);

            let response = match self.model.complete(&messages, &tool_defs).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("LLM request failed on iteration {}: {}", iteration, e);
                    return ConversationOutcome {
                        answer: FALLBACK_REPLY.to_string(),
                        iterations: iteration,
                        status: ConversationStatus::ModelFailed,
                        tool_calls_made,
                    };
                }
            };

            let requested = response.requested_tool_calls().to_vec();
            if requested.is_empty() {
                let answer = strip_thinking(response.content.as_deref().unwrap_or_default());
                let answer = if answer.is_empty() {
                    tracing::warn!("LLM returned an empty answer, using fallback");
                    FALLBACK_REPLY.to_string()
                } else {
                    answer
                };
                tracing::debug!("Conversation completed in {} iteration(s)", iteration);
                return ConversationOutcome {
                    answer,
                    iterations: iteration,
                    status: ConversationStatus::Final,
                    tool_calls_made,
                };
            }

            tracing::debug!("LLM requested {} tool call(s)", requested.len());
            messages.push(response);

            for tc in &requested {
                let (arguments, output) = match serde_json::from_str::<Value>(&tc.function.arguments)
                {
                    Ok(arguments) => {
                        let call = ToolCall {
                            name: tc.function.name.clone(),
                            arguments: arguments.clone(),
                        };
                        let result = self.registry.execute_call(&call, ctx).await;
                        (arguments, result.output)
                    }
                    Err(e) => {
                        let error = ToolError::ArgumentInvalid {
                            tool: tc.function.name.clone(),
                            reason: format!("arguments are not valid JSON: {}", e),
                        };
                        tracing::warn!("{}", error);
                        (Value::Null, ToolOutput::Error(error.to_string()))
                    }
                };

                messages.push(Message::tool_result(tc.id.clone(), output.to_llm_string()));
                tool_calls_made.push(ToolCallRecord {
                    tool_name: tc.function.name.clone(),
                    arguments,
                    output,
                });
            }

            messages.push(Message::user(STEERING_PROMPT));
        }

        tracing::warn!(
            "Conversation hit iteration limit ({}) without an answer",
            self.max_iterations
        );
        ConversationOutcome {
            answer: FALLBACK_REPLY.to_string(),
            iterations: self.max_iterations,
            status: ConversationStatus::IterationExhausted,
            tool_calls_made,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::parse_completion;
    use crate::testing::ScriptedModel;
    use crate::tools::Tool;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    struct ShoutTool;

    #[async_trait]
    impl Tool for ShoutTool {
        fn name(&self) -> &str {
            "shout"
        }

        fn description(&self) -> &str {
            "Upper-cases text"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            let text = params["text"].as_str().unwrap_or_default();
            if text == "boom" {
                anyhow::bail!("exploded");
            }
            Ok(ToolOutput::Text(text.to_uppercase()))
        }
    }

    async fn engine(model: Arc<ScriptedModel>) -> ConversationEngine {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(ShoutTool)).await;
        ConversationEngine::new(model, registry, DEFAULT_MAX_ITERATIONS)
    }

    fn turns() -> Vec<Message> {
        vec![Message::system("persona"), Message::user("alice said: hi")]
    }

    #[tokio::test]
    async fn plain_answer_finishes_in_one_iteration() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::text(
            "<think>hmm</think>Hello alice",
        )]));
        let outcome = engine(model.clone()).await.run(turns(), &ToolContext::default()).await;

        assert_eq!(outcome.status, ConversationStatus::Final);
        assert_eq!(outcome.answer, "Hello alice");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(model.calls(), 1);
        assert!(!model.last_tools_were_empty());
    }

    #[tokio::test]
    async fn empty_answer_becomes_fallback() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::empty()]));
        let outcome = engine(model).await.run(turns(), &ToolContext::default()).await;
        assert_eq!(outcome.status, ConversationStatus::Final);
        assert_eq!(outcome.answer, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn tool_results_are_attributed_and_followed_by_steering() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_calls(&[
                ("call_a", "shout", r#"{"text":"one"}"#),
                ("call_b", "shout", r#"{"text":"two"}"#),
            ]),
            ScriptedModel::text("ONE TWO"),
        ]));
        let outcome = engine(model.clone()).await.run(turns(), &ToolContext::default()).await;

        assert_eq!(outcome.answer, "ONE TWO");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls_made.len(), 2);

        let second = model.request(1);
        assert_eq!(second.len(), 2 + 1 + 2 + 1);
        assert_eq!(second[2].requested_tool_calls().len(), 2);
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(second[3].content.as_deref(), Some("ONE"));
        assert_eq!(second[4].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(second[4].content.as_deref(), Some("TWO"));
        assert_eq!(second[5].role, "user");
        assert_eq!(second[5].content.as_deref(), Some(STEERING_PROMPT));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_and_loop_continues() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_calls(&[("c1", "teleport", "{}")]),
            ScriptedModel::text("sorry, cannot teleport"),
        ]));
        let outcome = engine(model.clone()).await.run(turns(), &ToolContext::default()).await;

        assert_eq!(outcome.status, ConversationStatus::Final);
        let tool_turn = &model.request(1)[3];
        assert_eq!(tool_turn.role, "tool");
        assert!(tool_turn
            .content
            .as_deref()
            .unwrap()
            .contains("Tool 'teleport' not recognized"));
    }

    #[tokio::test]
    async fn malformed_arguments_and_tool_errors_feed_back() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_calls(&[
                ("c1", "shout", "{not json"),
                ("c2", "shout", r#"{"text":"boom"}"#),
                ("c3", "shout", r#"{"text":7}"#),
            ]),
            ScriptedModel::text("done"),
        ]));
        let outcome = engine(model.clone()).await.run(turns(), &ToolContext::default()).await;
        assert_eq!(outcome.answer, "done");

        let request = model.request(1);
        let results: Vec<String> = request[3..6]
            .iter()
            .map(|m| m.content.clone().unwrap_or_default())
            .collect();
        assert!(results[0].contains("Invalid arguments for tool 'shout'"));
        assert!(results[0].contains("not valid JSON"));
        assert!(results[1].contains("Tool 'shout' failed: exploded"));
        assert!(results[2].contains("must be of type string"));
        assert!(outcome.tool_calls_made.iter().all(|r| !r.output.is_success()));
    }

    #[tokio::test]
    async fn object_arguments_from_the_server_still_run_the_tool() {
        let sloppy = parse_completion(&json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "function": { "name": "shout", "arguments": { "text": "rust" } }
                    }]
                }
            }]
        }))
        .map_err(|e| e.to_string());
        let model = Arc::new(ScriptedModel::new(vec![sloppy, ScriptedModel::text("RUST it is")]));
        let outcome = engine(model.clone()).await.run(turns(), &ToolContext::default()).await;

        assert_eq!(outcome.status, ConversationStatus::Final);
        assert_eq!(outcome.answer, "RUST it is");
        let tool_turn = &model.request(1)[3];
        assert_eq!(tool_turn.tool_call_id.as_deref(), Some("tool_call_0"));
        assert_eq!(tool_turn.content.as_deref(), Some("RUST"));
    }

    #[tokio::test]
    async fn endless_tool_calls_exhaust_after_ten_iterations() {
        let script = (0..12)
            .map(|_| ScriptedModel::tool_calls(&[("c", "shout", r#"{"text":"again"}"#)]))
            .collect();
        let model = Arc::new(ScriptedModel::new(script));
        let outcome = engine(model.clone()).await.run(turns(), &ToolContext::default()).await;

        assert_eq!(outcome.status, ConversationStatus::IterationExhausted);
        assert_eq!(outcome.answer, FALLBACK_REPLY);
        assert_eq!(outcome.iterations, 10);
        assert_eq!(model.calls(), 10);
    }

    #[tokio::test]
    async fn model_failure_aborts_with_fallback() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_calls(&[("c", "shout", r#"{"text":"x"}"#)]),
            ScriptedModel::failure(),
            ScriptedModel::text("never reached"),
        ]));
        let outcome = engine(model.clone()).await.run(turns(), &ToolContext::default()).await;

        assert_eq!(outcome.status, ConversationStatus::ModelFailed);
        assert_eq!(outcome.answer, FALLBACK_REPLY);
        assert_eq!(model.calls(), 2);
    }
}
