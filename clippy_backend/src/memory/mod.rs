//! Persistent memory blob.
//!
//! A single free-form string the bot can append to or rewrite through tools.
//! It is injected into every system prompt, so it is kept below a high-water
//! mark by asking the model to summarize it, falling back to truncation.

use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::database::AgentDatabase;
use crate::llm_client::{strip_thinking, ChatModel, Message};

pub const EMPTY_MEMORY_PLACEHOLDER: &str = "(nothing stored on persistent memory yet)";

/// Summarization attempts before falling back to truncation.
pub const COMPACTION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    NotNeeded,
    Summarized { from: usize, to: usize },
    Truncated { from: usize, to: usize },
}

pub struct MemoryStore {
    db: Arc<AgentDatabase>,
    data: Mutex<String>,
}

impl MemoryStore {
    /// Load the blob from the database (empty if never written).
    pub fn open(db: Arc<AgentDatabase>) -> Result<Self> {
        let data = db.get_memory_blob()?.unwrap_or_default();
        Ok(Self {
            db,
            data: Mutex::new(data),
        })
    }

    fn data(&self) -> MutexGuard<'_, String> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Contents for prompting; a placeholder when nothing is stored yet.
    pub fn get_data(&self) -> String {
        let data = self.data();
        if data.is_empty() {
            EMPTY_MEMORY_PLACEHOLDER.to_string()
        } else {
            data.clone()
        }
    }

    pub fn raw(&self) -> String {
        self.data().clone()
    }

    pub fn char_len(&self) -> usize {
        self.data().chars().count()
    }

    pub fn replace(&self, text: &str) -> Result<()> {
        let mut data = self.data();
        self.db.set_memory_blob(text)?;
        *data = text.to_string();
        Ok(())
    }

    /// Append on a new line.
    pub fn append(&self, text: &str) -> Result<()> {
        let mut data = self.data();
        let updated = if text.starts_with('\n') {
            format!("{}{}", data, text)
        } else {
            format!("{}\n{}", data, text)
        };
        self.db.set_memory_blob(&updated)?;
        *data = updated;
        Ok(())
    }

    /// Shrink the blob once it exceeds `high_water` characters.
    ///
    /// A summary is accepted only if it fits in `low_water` characters and is
    /// shorter than the original. A failed model call counts as a failed
    /// attempt. After [`COMPACTION_ATTEMPTS`] failures the blob is cut to its
    /// first `low_water` characters.
    pub async fn compact(
        &self,
        model: &dyn ChatModel,
        high_water: usize,
        low_water: usize,
    ) -> Result<CompactionOutcome> {
        let original = self.raw();
        let original_len = original.chars().count();
        if original_len <= high_water {
            return Ok(CompactionOutcome::NotNeeded);
        }

        tracing::info!(
            "Memory is {} chars (limit {}), compacting to {}",
            original_len,
            high_water,
            low_water
        );

        let prompt = format!(
            "The following are your persistent memory notes. Rewrite them as a summary of at most \
             {} characters, keeping the facts that matter for future conversations. Reply with \
             only the summary.\n\n{}",
            low_water, original
        );

        for attempt in 1..=COMPACTION_ATTEMPTS {
            let reply = match model.complete(&[Message::user(prompt.clone())], &[]).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(
                        "Memory summarization attempt {}/{} failed: {}",
                        attempt,
                        COMPACTION_ATTEMPTS,
                        e
                    );
                    continue;
                }
            };

            let summary = strip_thinking(reply.content.as_deref().unwrap_or_default());
            let summary_len = summary.chars().count();
            if summary_len <= low_water && summary_len < original_len {
                self.replace(&summary)?;
                return Ok(CompactionOutcome::Summarized {
                    from: original_len,
                    to: summary_len,
                });
            }

            tracing::warn!(
                "Memory summary attempt {}/{} rejected ({} chars)",
                attempt,
                COMPACTION_ATTEMPTS,
                summary_len
            );
        }

        let truncated: String = original.chars().take(low_water).collect();
        let truncated_len = truncated.chars().count();
        self.replace(&truncated)?;
        tracing::warn!(
            "Memory truncated from {} to {} chars after failed summaries",
            original_len,
            truncated_len
        );
        Ok(CompactionOutcome::Truncated {
            from: original_len,
            to: truncated_len,
        })
    }
}
