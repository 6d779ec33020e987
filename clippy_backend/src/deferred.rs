//! Queue of side effects finished off the dispatch path.
//!
//! Background generation tasks push a [`DeferredJob`] once their artifact is
//! uploaded; the dispatch loop drains the queue between waits and posts each
//! job into its topic. Jobs are posted at most once: failures are logged and
//! the job is dropped.

use crate::forum::Forum;

#[derive(Debug, Clone, PartialEq)]
pub struct DeferredJob {
    pub topic_id: i64,
    pub artifact_url: String,
    pub prompt: String,
}

pub type DeferredSender = flume::Sender<DeferredJob>;

/// Cloning yields another handle onto the same queue.
#[derive(Clone)]
pub struct DeferredQueue {
    tx: flume::Sender<DeferredJob>,
    rx: flume::Receiver<DeferredJob>,
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> DeferredSender {
        self.tx.clone()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Post every queued job in FIFO order. Returns how many were posted.
    pub async fn drain(&self, forum: &dyn Forum) -> usize {
        let mut posted = 0;
        while let Ok(job) = self.rx.try_recv() {
            let content = render_job(&job);
            match forum.reply_to_topic(job.topic_id, None, &content).await {
                Ok(pid) => {
                    posted += 1;
                    tracing::info!(
                        "Posted generated image to topic {} (pid {})",
                        job.topic_id,
                        pid
                    );
                }
                Err(e) => tracing::error!(
                    "Dropping generated image for topic {}: {}",
                    job.topic_id,
                    e
                ),
            }
        }
        posted
    }
}

/// Make a prompt safe to use as a markdown image title.
///
/// Quotes, backticks and brackets are escaped, `@` is blanked so the post
/// cannot mention anyone, and line breaks are flattened.
pub fn sanitize_prompt(prompt: &str) -> String {
    let mut out = String::with_capacity(prompt.len());
    for c in prompt.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '`' => out.push_str("\\`"),
            '[' => out.push_str("\\["),
            ']' => out.push_str("\\]"),
            '@' | '\n' | '\r' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

pub fn render_job(job: &DeferredJob) -> String {
    format!(
        "![generated image]({} \"{}\")",
        job.artifact_url,
        sanitize_prompt(&job.prompt)
    )
}
