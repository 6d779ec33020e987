//! NodeBB adapter: reads over the JSON API, writes over the realtime channel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};

use super::markup::html_to_markdown;
use super::session::SessionClient;
use super::{Comment, Forum, Notification, Topic};
use crate::error::{ForumError, ForumResult};
use crate::realtime::RealtimeChannel;

pub const NEW_NOTIFICATION_EVENT: &str = "event:new_notification";

pub struct NodeBB {
    session: Arc<SessionClient>,
    realtime: RealtimeChannel,
}

impl NodeBB {
    pub fn new(session: Arc<SessionClient>, realtime: RealtimeChannel) -> Self {
        Self { session, realtime }
    }

    pub fn session(&self) -> &Arc<SessionClient> {
        &self.session
    }

    pub fn realtime(&self) -> &RealtimeChannel {
        &self.realtime
    }

    fn csrf(&self) -> Value {
        self.session
            .csrf_token()
            .map(Value::String)
            .unwrap_or(Value::Null)
    }
}

#[async_trait]
impl Forum for NodeBB {
    async fn list_notifications(&self) -> ForumResult<Vec<Notification>> {
        let body = self.session.get_json("/api/notifications").await?;
        parse_notifications(&body)
    }

    async fn get_topic(&self, tid: i64) -> ForumResult<Topic> {
        let body = self.session.get_json(&format!("/api/topic/{}", tid)).await?;
        parse_topic(&body)
    }

    async fn get_comments(&self, topic: &Topic) -> ForumResult<Vec<Comment>> {
        let path = format!("/api/topic/{}/{}", topic.slug, topic.post_count.max(1));
        let body = self.session.get_json(&path).await?;
        parse_comments(&body)
    }

    async fn list_recent_topics(&self) -> ForumResult<Vec<Topic>> {
        let body = self.session.get_json("/api/recent").await?;
        let topics = body
            .get("topics")
            .and_then(Value::as_array)
            .ok_or_else(|| ForumError::invalid("/api/recent has no topics"))?;
        topics.iter().map(parse_topic).collect()
    }

    async fn reply_to_topic(
        &self,
        tid: i64,
        to_pid: Option<i64>,
        content: &str,
    ) -> ForumResult<i64> {
        let payload = json!({
            "tid": tid,
            "content": content,
            "toPid": to_pid,
            "lock": false,
            "_csrf": self.csrf(),
        });
        let response = self.realtime.call("posts.reply", payload).await?;
        int_field(&response, "pid")
    }

    async fn create_topic(&self, cid: i64, title: &str, content: &str) -> ForumResult<i64> {
        let payload = json!({
            "cid": cid,
            "title": title,
            "content": content,
            "tags": [],
            "thumb": "",
            "_csrf": self.csrf(),
        });
        let response = self.realtime.call("topics.post", payload).await?;
        int_field(&response, "tid")
    }

    async fn mark_notification_read(&self, nid: &str) -> ForumResult<()> {
        self.realtime
            .call("notifications.markRead", Value::String(nid.to_string()))
            .await?;
        Ok(())
    }

    async fn mark_notification_unread(&self, nid: &str) -> ForumResult<()> {
        self.realtime
            .call("notifications.markUnread", Value::String(nid.to_string()))
            .await?;
        Ok(())
    }

    async fn upload_image(&self, jpeg: Vec<u8>, filename: &str) -> ForumResult<String> {
        let part = Part::bytes(jpeg)
            .file_name(filename.to_string())
            .mime_str("image/jpeg")?;
        let form = Form::new().part("files[]", part);
        let response = self
            .session
            .post_multipart("/api/post/upload", form)
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ForumError::invalid(format!("upload response is not JSON: {}", e)))?;
        parse_upload_url(&body)
    }

    async fn download(&self, url: &str) -> ForumResult<Vec<u8>> {
        self.session.get_bytes(url).await
    }
}

// ============================================================================
// Response parsing
// ============================================================================

/// NodeBB is inconsistent about numbers vs numeric strings.
fn int_field(value: &Value, key: &str) -> ForumResult<i64> {
    match value.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| ForumError::invalid(format!("'{}' is not an integer", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| ForumError::invalid(format!("'{}' is not an integer: {}", key, s))),
        _ => Err(ForumError::invalid(format!("missing '{}'", key))),
    }
}

fn int_field_or(value: &Value, key: &str, default: i64) -> i64 {
    int_field(value, key).unwrap_or(default)
}

fn str_field(value: &Value, key: &str) -> ForumResult<String> {
    match value.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ForumError::invalid(format!("missing '{}'", key))),
    }
}

fn flag_field(value: &Value, key: &str) -> bool {
    match value.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn millis_to_datetime(millis: i64) -> ForumResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ForumError::invalid(format!("timestamp out of range: {}", millis)))
}

/// Prefer the ISO field, fall back to epoch milliseconds.
fn time_field(value: &Value, iso_key: &str, millis_key: &str) -> ForumResult<DateTime<Utc>> {
    if let Some(iso) = value.get(iso_key).and_then(Value::as_str) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(iso) {
            return Ok(parsed.with_timezone(&Utc));
        }
    }
    millis_to_datetime(int_field(value, millis_key)?)
}

pub fn parse_notifications(body: &Value) -> ForumResult<Vec<Notification>> {
    let items = body
        .get("notifications")
        .and_then(Value::as_array)
        .ok_or_else(|| ForumError::invalid("notifications list missing"))?;

    items
        .iter()
        .map(|item| {
            let username = item
                .get("user")
                .and_then(|user| user.get("username"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Notification {
                nid: str_field(item, "nid")?,
                pid: int_field(item, "pid")?,
                tid: int_field(item, "tid")?,
                kind: str_field(item, "type").unwrap_or_default(),
                username,
                datetime: millis_to_datetime(int_field(item, "datetime")?)?,
                read: flag_field(item, "read"),
            })
        })
        .collect()
}

pub fn parse_topic(body: &Value) -> ForumResult<Topic> {
    Ok(Topic {
        tid: int_field(body, "tid")?,
        cid: int_field(body, "cid")?,
        uid: int_field_or(body, "uid", 0),
        slug: str_field(body, "slug")?,
        title: str_field(body, "titleRaw").or_else(|_| str_field(body, "title"))?,
        post_count: int_field(body, "postcount")?,
        main_pid: int_field_or(body, "mainPid", 0),
        locked: flag_field(body, "locked"),
        deleted: flag_field(body, "deleted"),
        timestamp: time_field(body, "timestampISO", "timestamp")?,
        last_post_time: time_field(body, "lastposttimeISO", "lastposttime")
            .or_else(|_| time_field(body, "timestampISO", "timestamp"))?,
    })
}

pub fn parse_comments(body: &Value) -> ForumResult<Vec<Comment>> {
    let posts = body
        .get("posts")
        .and_then(Value::as_array)
        .ok_or_else(|| ForumError::invalid("topic has no posts list"))?;

    posts
        .iter()
        .map(|post| {
            let username = post
                .get("user")
                .and_then(|user| user.get("username"))
                .and_then(Value::as_str)
                .ok_or_else(|| ForumError::invalid("post without user.username"))?
                .to_string();
            Ok(Comment {
                pid: int_field(post, "pid")?,
                tid: int_field(post, "tid")?,
                uid: int_field_or(post, "uid", 0),
                username,
                content: html_to_markdown(&str_field(post, "content")?),
                timestamp: time_field(post, "timestampISO", "timestamp")?,
            })
        })
        .collect()
}

/// `[{"url": ...}]` from the classic upload route, or the newer
/// `{"response": {"images": [{"url": ...}]}}` envelope.
pub fn parse_upload_url(body: &Value) -> ForumResult<String> {
    let first = match body {
        Value::Array(items) => items.first(),
        other => other
            .pointer("/response/images")
            .and_then(Value::as_array)
            .and_then(|images| images.first()),
    };
    first
        .and_then(|image| image.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ForumError::invalid(format!("upload response has no url: {}", body)))
}
