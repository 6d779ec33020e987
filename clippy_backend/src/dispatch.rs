//! Notification dispatch loop.
//!
//! Polls the forum for unread notifications and handles them strictly one
//! at a time: fetch the topic, rebuild the conversation from its comments,
//! run the conversation engine, reply, compact memory, mark read. Between
//! polls it idles on the realtime activity signal, draining the deferred
//! queue after every slice.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

use crate::config::AgentConfig;
use crate::deferred::DeferredQueue;
use crate::forum::{Comment, Forum, Notification, Topic};
use crate::llm_client::Message;
use crate::memory::MemoryStore;
use crate::tools::agentic::{ConversationEngine, ConversationStatus};
use crate::tools::ToolContext;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// The bot's own forum username; its comments become assistant turns.
    pub username: String,
    pub persona_prompt: String,
    pub poll_interval: Duration,
    pub activity_wait: Duration,
    pub memory_high_water: usize,
    pub memory_low_water: usize,
}

impl DispatchSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            username: config.username.clone(),
            persona_prompt: config.persona_prompt(),
            poll_interval: config.poll_interval(),
            activity_wait: config.activity_wait(),
            memory_high_water: config.memory_high_water,
            memory_low_water: config.memory_low_water,
        }
    }
}

/// What happened to one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Replied { pid: i64 },
    /// The referenced comment no longer exists.
    CommentMissing,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleWake {
    Activity,
    PollDue,
}

pub struct DispatchLoop {
    forum: Arc<dyn Forum>,
    engine: ConversationEngine,
    memory: Arc<MemoryStore>,
    deferred: DeferredQueue,
    activity: Arc<Notify>,
    settings: DispatchSettings,
}

impl DispatchLoop {
    pub fn new(
        forum: Arc<dyn Forum>,
        engine: ConversationEngine,
        memory: Arc<MemoryStore>,
        deferred: DeferredQueue,
        activity: Arc<Notify>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            forum,
            engine,
            memory,
            deferred,
            activity,
            settings,
        }
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    /// Handle every unread notification in the order the forum returned them.
    pub async fn check_notifications(&self) -> Result<usize> {
        let pending: Vec<Notification> = self
            .forum
            .list_notifications()
            .await
            .context("Failed to list notifications")?
            .into_iter()
            .filter(|n| !n.read)
            .collect();

        if !pending.is_empty() {
            tracing::info!("{} unread notification(s)", pending.len());
        }
        for notification in &pending {
            self.handle_notification(notification).await;
        }
        Ok(pending.len())
    }

    /// Process one notification and mark it read whatever the result.
    pub async fn handle_notification(&self, notification: &Notification) -> NotificationOutcome {
        tracing::info!(
            "Handling {} notification {} from {} (topic {}, post {})",
            notification.kind,
            notification.nid,
            notification.username,
            notification.tid,
            notification.pid
        );

        let outcome = match self.process(notification).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Notification {} failed: {:#}", notification.nid, e);
                NotificationOutcome::Failed(format!("{:#}", e))
            }
        };

        if let Err(e) = self.forum.mark_notification_read(&notification.nid).await {
            tracing::error!("Failed to mark notification {} read: {}", notification.nid, e);
        }
        outcome
    }

    async fn process(&self, notification: &Notification) -> Result<NotificationOutcome> {
        let topic = self
            .forum
            .get_topic(notification.tid)
            .await
            .with_context(|| format!("Failed to fetch topic {}", notification.tid))?;
        let comments = self
            .forum
            .get_comments(&topic)
            .await
            .with_context(|| format!("Failed to fetch comments of topic {}", topic.tid))?;

        let Some(trigger_index) = comments.iter().position(|c| c.pid == notification.pid) else {
            tracing::warn!(
                "Comment {} referenced by notification {} was not found in topic {}",
                notification.pid,
                notification.nid,
                topic.tid
            );
            return Ok(NotificationOutcome::CommentMissing);
        };

        let turns = self.build_turns(&topic, &comments, trigger_index);
        let ctx = ToolContext {
            username: self.settings.username.clone(),
            topic_id: Some(topic.tid),
            post_id: Some(notification.pid),
            deferred: Some(self.deferred.sender()),
            memory: Some(self.memory.clone()),
        };

        let outcome = self.engine.run(turns, &ctx).await;
        if outcome.status != ConversationStatus::Final {
            tracing::warn!(
                "Conversation for notification {} ended with {:?} after {} iteration(s)",
                notification.nid,
                outcome.status,
                outcome.iterations
            );
        }

        let pid = self
            .forum
            .reply_to_topic(topic.tid, Some(notification.pid), &outcome.answer)
            .await
            .with_context(|| format!("Failed to reply in topic {}", topic.tid))?;
        tracing::info!("Replied in topic {} with post {}", topic.tid, pid);

        self.compact_memory().await;
        Ok(NotificationOutcome::Replied { pid })
    }

    async fn compact_memory(&self) {
        match self
            .memory
            .compact(
                self.engine.model().as_ref(),
                self.settings.memory_high_water,
                self.settings.memory_low_water,
            )
            .await
        {
            Ok(outcome) => tracing::debug!("Memory compaction: {:?}", outcome),
            Err(e) => tracing::error!("Memory compaction failed: {:#}", e),
        }
    }

    /// System persona with memory, the comments before the trigger, then the trigger.
    pub fn build_turns(&self, topic: &Topic, comments: &[Comment], trigger_index: usize) -> Vec<Message> {
        let system = format!(
            "{}\n\nYou are replying in the topic \"{}\".\n\nYour persistent memory:\n{}",
            self.settings.persona_prompt,
            topic.title,
            self.memory.get_data()
        );

        let mut turns = vec![Message::system(system)];
        turns.extend(
            comments
                .iter()
                .take(trigger_index + 1)
                .map(|comment| self.comment_turn(comment)),
        );
        turns
    }

    fn comment_turn(&self, comment: &Comment) -> Message {
        if comment.username.eq_ignore_ascii_case(&self.settings.username) {
            Message::assistant(comment.content.clone())
        } else {
            Message::user(format!("{} said: {}", comment.username, comment.content))
        }
    }

    /// Wait for activity or the next scheduled poll, posting deferred jobs
    /// after every slice.
    pub async fn idle(&self) -> IdleWake {
        let deadline = Instant::now() + self.settings.poll_interval;
        loop {
            self.deferred.drain(self.forum.as_ref()).await;

            let now = Instant::now();
            if now >= deadline {
                return IdleWake::PollDue;
            }
            let slice = self.settings.activity_wait.min(deadline - now);
            if timeout(slice, self.activity.notified()).await.is_ok() {
                tracing::debug!("Realtime activity signalled");
                return IdleWake::Activity;
            }
        }
    }

    /// Poll, idle, repeat. Returns only when listing notifications fails.
    pub async fn run_forever(&self) -> Result<()> {
        tracing::info!("Dispatch loop starting as {}", self.settings.username);
        loop {
            self.check_notifications().await?;
            self.idle().await;
        }
    }
}
