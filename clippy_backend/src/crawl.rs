//! One-shot ingestion of recent topics into the forum store.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::database::AgentDatabase;
use crate::forum::nodebb::NodeBB;
use crate::forum::Forum;
use crate::realtime::RealtimeChannel;
use crate::runtime::login_session;
use crate::store::ForumStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    pub topics: usize,
    pub comments: usize,
    pub failed_topics: usize,
}

/// Ingest the comments of every recent topic. A topic whose comments cannot
/// be fetched is skipped.
pub async fn crawl(forum: &dyn Forum, store: &ForumStore) -> Result<CrawlReport> {
    let topics = forum
        .list_recent_topics()
        .await
        .context("Failed to list recent topics")?;

    let mut report = CrawlReport::default();
    for topic in &topics {
        let comments = match forum.get_comments(topic).await {
            Ok(comments) => comments,
            Err(e) => {
                tracing::warn!("Skipping topic {} '{}': {}", topic.tid, topic.title, e);
                report.failed_topics += 1;
                continue;
            }
        };
        report.comments += store.ingest_topic(topic.tid, &topic.title, &comments)?;
        report.topics += 1;
    }
    Ok(report)
}

/// Log in, crawl once, exit. Writes never happen here, so the realtime
/// channel is never connected.
pub async fn crawl_once(config: &AgentConfig) -> Result<CrawlReport> {
    let db = Arc::new(
        AgentDatabase::new(&config.database_path)
            .with_context(|| format!("Failed to open database at '{}'", config.database_path))?,
    );
    let store = ForumStore::new(db);

    let session = login_session(config).await?;
    let forum = NodeBB::new(session, RealtimeChannel::new(config.realtime.clone()));

    let report = crawl(&forum, &store).await?;
    tracing::info!(
        "Crawl finished: {} topic(s), {} comment(s), {} skipped; store holds {} document(s)",
        report.topics,
        report.comments,
        report.failed_topics,
        store.len()?
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{comment, topic, FakeForum};

    #[tokio::test]
    async fn ingests_every_recent_topic() {
        let dir = tempfile::tempdir().unwrap();
        let store = ForumStore::new(Arc::new(
            AgentDatabase::new(dir.path().join("crawl.db")).unwrap(),
        ));
        let forum = FakeForum::default()
            .with_topic(
                topic(1, "Coffee"),
                vec![
                    comment(10, 1, "alice", "espresso please"),
                    comment(11, 1, "bob", "filter coffee"),
                ],
            )
            .with_topic(topic(2, "Empty"), vec![]);

        let report = crawl(&forum, &store).await.unwrap();
        assert_eq!(
            report,
            CrawlReport {
                topics: 2,
                comments: 2,
                failed_topics: 0,
            }
        );
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(
            store.search("espresso", 5).unwrap()[0].text,
            "In topic Coffee, @alice said: espresso please"
        );
    }
}
