//! Searchable corpus of recent forum comments.
//!
//! Filled by the crawl entry point and queried by the `search_forum` tool.
//! Matching is plain keyword overlap: candidates come from SQLite `LIKE`
//! filters, then get ranked by how many distinct query terms they contain.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use crate::database::{AgentDatabase, ForumDocument};
use crate::forum::Comment;

/// Query words shorter than this are ignored.
const MIN_TERM_LEN: usize = 3;

pub struct ForumStore {
    db: Arc<AgentDatabase>,
}

impl ForumStore {
    pub fn new(db: Arc<AgentDatabase>) -> Self {
        Self { db }
    }

    pub fn document_id(tid: i64, pid: i64) -> String {
        format!("topic_{}_comment_{}", tid, pid)
    }

    pub fn ingest_comments(&self, tid: i64, title: &str, comments: &[Comment]) -> Result<usize> {
        let now = Utc::now();
        for comment in comments {
            self.db.upsert_document(&ForumDocument {
                doc_id: Self::document_id(tid, comment.pid),
                topic_id: tid,
                post_id: comment.pid,
                title: title.to_string(),
                username: comment.username.clone(),
                text: format!(
                    "In topic {}, @{} said: {}",
                    title, comment.username, comment.content
                ),
                ingested_at: now,
            })?;
        }
        Ok(comments.len())
    }

    pub fn ingest_topic(&self, tid: i64, title: &str, comments: &[Comment]) -> Result<usize> {
        let count = self.ingest_comments(tid, title, comments)?;
        tracing::debug!("Ingested {} comment(s) from topic {} '{}'", count, tid, title);
        Ok(count)
    }

    pub fn len(&self) -> Result<usize> {
        self.db.count_documents()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Best `limit` documents for `query`, most matching terms first and
    /// newer posts breaking ties.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ForumDocument>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, ForumDocument)> = self
            .db
            .find_documents_matching(&terms)?
            .into_iter()
            .map(|doc| {
                let text = doc.text.to_lowercase();
                let score = terms.iter().filter(|t| text.contains(t.as_str())).count();
                (score, doc)
            })
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b.cmp(score_a).then(b.post_id.cmp(&a.post_id))
        });
        Ok(scored.into_iter().take(limit).map(|(_, doc)| doc).collect())
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_TERM_LEN)
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}
