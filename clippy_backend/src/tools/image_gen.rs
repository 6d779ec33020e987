//! `generate_image`: draw a picture and post it into the current topic.
//!
//! Generation takes minutes, so the tool only starts a background task and
//! returns at once. The task renders the image, uploads it to the forum and
//! drops a [`DeferredJob`] on the queue; the dispatch loop posts it later.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use super::vision::encode_jpeg;
use super::{Tool, ToolCategory, ToolContext, ToolOutput};
use crate::config::ImageGenConfig;
use crate::deferred::{DeferredJob, DeferredSender};
use crate::forum::Forum;
use crate::http_client::build_http_client;

/// Key the AI Horde accepts for anonymous, lowest-priority requests.
const ANONYMOUS_HORDE_KEY: &str = "0000000000";

/// Anything that turns a prompt into encoded image bytes.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>>;
}

/// AI Horde asynchronous generation API.
pub struct HordeBackend {
    config: ImageGenConfig,
    client: reqwest::Client,
}

impl HordeBackend {
    pub fn new(config: ImageGenConfig) -> Self {
        Self {
            config,
            client: build_http_client(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn api_key(&self) -> &str {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .unwrap_or(ANONYMOUS_HORDE_KEY)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(self.endpoint(path))
            .header("apikey", self.api_key())
            .send()
            .await
            .with_context(|| format!("AI Horde request {} failed", path))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("AI Horde {} returned {}: {}", path, status, body);
        }
        response.json().await.context("AI Horde returned invalid JSON")
    }

    async fn submit(&self, prompt: &str) -> Result<String> {
        let body = generation_request(&self.config, prompt);
        let response = self
            .client
            .post(self.endpoint("/generate/async"))
            .header("apikey", self.api_key())
            .json(&body)
            .send()
            .await
            .context("Failed to submit generation to AI Horde")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("AI Horde rejected generation ({}): {}", status, body);
        }
        let body: Value = response.json().await.context("AI Horde returned invalid JSON")?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("AI Horde response has no job id")
    }

    async fn wait_for_completion(&self, job_id: &str) -> Result<()> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                anyhow::bail!("Image generation timed out after {}s", timeout.as_secs());
            }

            let check = self.get_json(&format!("/generate/check/{}", job_id)).await?;
            match job_state(&check) {
                JobState::Done => return Ok(()),
                JobState::Faulted => anyhow::bail!("AI Horde job {} faulted", job_id),
                JobState::Impossible => {
                    anyhow::bail!("AI Horde has no worker able to run job {}", job_id)
                }
                JobState::Waiting => {}
            }

            sleep(interval).await;
        }
    }
}

#[async_trait]
impl ImageBackend for HordeBackend {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>> {
        let job_id = self.submit(prompt).await?;
        tracing::info!("AI Horde job {} queued", job_id);
        self.wait_for_completion(&job_id).await?;

        let status = self.get_json(&format!("/generate/status/{}", job_id)).await?;
        let image_url = first_generation_url(&status).context("AI Horde returned no image")?;

        let response = self
            .client
            .get(&image_url)
            .send()
            .await
            .context("Failed to download generated image")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Generated image download returned {}", status);
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Waiting,
    Done,
    Faulted,
    Impossible,
}

fn job_state(check: &Value) -> JobState {
    let flag = |key: &str| check.get(key).and_then(Value::as_bool).unwrap_or(false);
    if flag("faulted") {
        JobState::Faulted
    } else if flag("done") {
        JobState::Done
    } else if check.get("is_possible").and_then(Value::as_bool) == Some(false) {
        JobState::Impossible
    } else {
        JobState::Waiting
    }
}

fn generation_request(config: &ImageGenConfig, prompt: &str) -> Value {
    json!({
        "prompt": prompt,
        "models": [config.model_name],
        "params": {
            "width": config.width,
            "height": config.height,
            "steps": config.steps,
            "cfg_scale": config.cfg_scale,
            "sampler_name": config.sampler,
            "n": 1
        }
    })
}

fn first_generation_url(status: &Value) -> Option<String> {
    status
        .get("generations")?
        .as_array()?
        .first()?
        .get("img")?
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

pub struct GenerateImageTool {
    backend: Arc<dyn ImageBackend>,
    forum: Arc<dyn Forum>,
}

impl GenerateImageTool {
    pub fn new(backend: Arc<dyn ImageBackend>, forum: Arc<dyn Forum>) -> Self {
        Self { backend, forum }
    }
}

#[async_trait]
impl Tool for GenerateImageTool {
    fn name(&self) -> &str {
        "generate_image"
    }

    fn description(&self) -> &str {
        "Generate an image from a text prompt and post it in the current topic. The image \
         appears on its own a few minutes later; tell the user it is on its way."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Detailed description of the image to draw"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if prompt.is_empty() {
            return Ok(ToolOutput::Error("Image prompt is empty".to_string()));
        }

        let (Some(topic_id), Some(deferred)) = (ctx.topic_id, ctx.deferred.clone()) else {
            return Ok(ToolOutput::Error(
                "error: there is no topic to post the image in".to_string(),
            ));
        };

        tracing::info!("Generating image for topic {}: {}", topic_id, prompt);
        let backend = self.backend.clone();
        let forum = self.forum.clone();
        tokio::spawn(async move {
            if let Err(e) =
                generate_and_upload(backend.as_ref(), forum.as_ref(), &deferred, topic_id, prompt)
                    .await
            {
                tracing::error!("Image generation for topic {} failed: {:#}", topic_id, e);
            }
        });

        Ok(ToolOutput::Text("generating image...".to_string()))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Media
    }
}

async fn generate_and_upload(
    backend: &dyn ImageBackend,
    forum: &dyn Forum,
    deferred: &DeferredSender,
    topic_id: i64,
    prompt: String,
) -> Result<()> {
    let raw = backend.generate(&prompt).await?;
    let jpeg = encode_jpeg(&raw)?;
    let filename = format!("generated_{}.jpg", chrono::Utc::now().timestamp_millis());
    let artifact_url = forum
        .upload_image(jpeg, &filename)
        .await
        .context("Failed to upload generated image")?;
    tracing::info!("Generated image uploaded to {}", artifact_url);

    deferred
        .send(DeferredJob {
            topic_id,
            artifact_url,
            prompt,
        })
        .map_err(|_| anyhow::anyhow!("deferred queue is closed"))?;
    Ok(())
}
