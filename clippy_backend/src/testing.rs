//! Hand-written fakes shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::error::{ForumError, ForumResult, ModelError, RealtimeError};
use crate::forum::{Comment, Forum, Notification, Topic};
use crate::llm_client::{ChatModel, LlmFunctionCall, LlmToolCall, Message};
use crate::tools::ToolDef;

/// Plays back canned replies; `Err` entries become model failures.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<Message, String>>>,
    requests: Mutex<Vec<(Vec<Message>, usize)>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<Message, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn text(content: &str) -> Result<Message, String> {
        Ok(Message::assistant(content))
    }

    pub fn empty() -> Result<Message, String> {
        Ok(Message {
            role: "assistant".to_string(),
            content: None,
            tool_calls: None,
            tool_call_id: None,
        })
    }

    /// `(id, name, raw json arguments)` per call.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Result<Message, String> {
        Ok(Message {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(
                calls
                    .iter()
                    .map(|(id, name, args)| LlmToolCall {
                        id: id.to_string(),
                        call_type: "function".to_string(),
                        function: LlmFunctionCall {
                            name: name.to_string(),
                            arguments: args.to_string(),
                        },
                    })
                    .collect(),
            ),
            tool_call_id: None,
        })
    }

    pub fn failure() -> Result<Message, String> {
        Err("scripted failure".to_string())
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> Vec<Message> {
        self.requests.lock().unwrap()[index].0.clone()
    }

    pub fn last_tools_were_empty(&self) -> bool {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|(_, tools)| *tools == 0)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<Message, ModelError> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), tools.len()));
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(message)) => Ok(message),
            Some(Err(body)) => Err(ModelError::RequestFailed { status: 500, body }),
            None => Err(ModelError::RequestFailed {
                status: 500,
                body: "script exhausted".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedReply {
    pub tid: i64,
    pub to_pid: Option<i64>,
    pub content: String,
}

/// In-memory forum recording every write.
#[derive(Default)]
pub struct FakeForum {
    pub notifications: Mutex<Vec<Notification>>,
    pub topics: Mutex<HashMap<i64, Topic>>,
    pub comments: Mutex<HashMap<i64, Vec<Comment>>>,
    pub replies: Mutex<Vec<PostedReply>>,
    pub marked_read: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<(usize, String)>>,
    pub media: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_replies: Mutex<bool>,
    pub fail_listing: Mutex<bool>,
    pub panic_listing: Mutex<bool>,
}

impl FakeForum {
    pub fn with_topic(self, topic: Topic, comments: Vec<Comment>) -> Self {
        self.comments.lock().unwrap().insert(topic.tid, comments);
        self.topics.lock().unwrap().insert(topic.tid, topic);
        self
    }

    pub fn with_notification(self, notification: Notification) -> Self {
        self.notifications.lock().unwrap().push(notification);
        self
    }

    pub fn replies(&self) -> Vec<PostedReply> {
        self.replies.lock().unwrap().clone()
    }

    pub fn marked_read(&self) -> Vec<String> {
        self.marked_read.lock().unwrap().clone()
    }
}

pub fn topic(tid: i64, title: &str) -> Topic {
    let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    Topic {
        tid,
        cid: 1,
        uid: 1,
        slug: format!("{}/topic", tid),
        title: title.to_string(),
        post_count: 0,
        main_pid: 0,
        locked: false,
        deleted: false,
        timestamp: at,
        last_post_time: at,
    }
}

pub fn comment(pid: i64, tid: i64, username: &str, content: &str) -> Comment {
    Comment {
        pid,
        tid,
        uid: 1,
        username: username.to_string(),
        content: content.to_string(),
        timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + pid).unwrap(),
    }
}

pub fn notification(nid: &str, tid: i64, pid: i64, read: bool) -> Notification {
    Notification {
        nid: nid.to_string(),
        pid,
        tid,
        kind: "mention".to_string(),
        username: "alice".to_string(),
        datetime: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        read,
    }
}

#[async_trait]
impl Forum for FakeForum {
    async fn list_notifications(&self) -> ForumResult<Vec<Notification>> {
        let explode = *self.panic_listing.lock().unwrap();
        if explode {
            panic!("notification listing exploded");
        }
        if *self.fail_listing.lock().unwrap() {
            return Err(ForumError::RequestFailed {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        Ok(self.notifications.lock().unwrap().clone())
    }

    async fn get_topic(&self, tid: i64) -> ForumResult<Topic> {
        self.topics
            .lock()
            .unwrap()
            .get(&tid)
            .cloned()
            .ok_or_else(|| ForumError::RequestFailed {
                status: 404,
                body: "not found".to_string(),
            })
    }

    async fn get_comments(&self, topic: &Topic) -> ForumResult<Vec<Comment>> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&topic.tid)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_recent_topics(&self) -> ForumResult<Vec<Topic>> {
        let mut topics: Vec<Topic> = self.topics.lock().unwrap().values().cloned().collect();
        topics.sort_by_key(|t| t.tid);
        Ok(topics)
    }

    async fn reply_to_topic(
        &self,
        tid: i64,
        to_pid: Option<i64>,
        content: &str,
    ) -> ForumResult<i64> {
        if *self.fail_replies.lock().unwrap() {
            return Err(ForumError::Realtime(RealtimeError::CallFailed {
                event: "posts.reply".to_string(),
                trials: 5,
                last_error: "method error".to_string(),
            }));
        }
        let mut replies = self.replies.lock().unwrap();
        replies.push(PostedReply {
            tid,
            to_pid,
            content: content.to_string(),
        });
        Ok(1000 + replies.len() as i64)
    }

    async fn create_topic(&self, _cid: i64, _title: &str, _content: &str) -> ForumResult<i64> {
        Ok(99)
    }

    async fn mark_notification_read(&self, nid: &str) -> ForumResult<()> {
        self.marked_read.lock().unwrap().push(nid.to_string());
        for n in self.notifications.lock().unwrap().iter_mut() {
            if n.nid == nid {
                n.read = true;
            }
        }
        Ok(())
    }

    async fn mark_notification_unread(&self, nid: &str) -> ForumResult<()> {
        for n in self.notifications.lock().unwrap().iter_mut() {
            if n.nid == nid {
                n.read = false;
            }
        }
        Ok(())
    }

    async fn upload_image(&self, jpeg: Vec<u8>, filename: &str) -> ForumResult<String> {
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push((jpeg.len(), filename.to_string()));
        Ok(format!("/assets/uploads/{}", filename))
    }

    async fn download(&self, url: &str) -> ForumResult<Vec<u8>> {
        self.media
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ForumError::RequestFailed {
                status: 404,
                body: url.to_string(),
            })
    }
}
