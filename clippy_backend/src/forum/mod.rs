//! Forum domain model and the operations the bot needs from a forum.

pub mod markup;
pub mod nodebb;
pub mod session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ForumResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub nid: String,
    pub pid: i64,
    pub tid: i64,
    /// NodeBB notification type, e.g. `mention` or `new-reply`.
    pub kind: String,
    pub username: String,
    pub datetime: DateTime<Utc>,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub tid: i64,
    pub cid: i64,
    pub uid: i64,
    pub slug: String,
    pub title: String,
    pub post_count: i64,
    pub main_pid: i64,
    pub locked: bool,
    pub deleted: bool,
    pub timestamp: DateTime<Utc>,
    pub last_post_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub pid: i64,
    pub tid: i64,
    pub uid: i64,
    pub username: String,
    /// Markdown, converted from the rendered post HTML.
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Forum: Send + Sync {
    async fn list_notifications(&self) -> ForumResult<Vec<Notification>>;

    async fn get_topic(&self, tid: i64) -> ForumResult<Topic>;

    /// Comments of a topic in forum order.
    async fn get_comments(&self, topic: &Topic) -> ForumResult<Vec<Comment>>;

    async fn list_recent_topics(&self) -> ForumResult<Vec<Topic>>;

    /// Post a reply, optionally threaded to `to_pid`. Returns the new post id.
    async fn reply_to_topic(&self, tid: i64, to_pid: Option<i64>, content: &str)
        -> ForumResult<i64>;

    /// Returns the new topic id.
    async fn create_topic(&self, cid: i64, title: &str, content: &str) -> ForumResult<i64>;

    async fn mark_notification_read(&self, nid: &str) -> ForumResult<()>;

    async fn mark_notification_unread(&self, nid: &str) -> ForumResult<()>;

    /// Upload a JPEG and return its public URL.
    async fn upload_image(&self, jpeg: Vec<u8>, filename: &str) -> ForumResult<String>;

    /// Download media; forum-relative URLs resolve against the forum.
    async fn download(&self, url: &str) -> ForumResult<Vec<u8>>;
}
