//! `ask_image`: answer a question about an image posted on the forum.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;

use super::{Tool, ToolCategory, ToolContext, ToolOutput};
use crate::error::ModelError;
use crate::forum::Forum;
use crate::llm_client::LlmClient;

/// Decode any supported image format and re-encode it as RGB JPEG.
pub fn encode_jpeg(bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes).context("Unsupported or corrupt image")?;
    // JPEG has no alpha channel.
    let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, image::ImageFormat::Jpeg)
        .context("Failed to encode JPEG")?;
    Ok(out.into_inner())
}

/// A model that can look at a picture.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn describe(&self, jpeg: &[u8], question: &str) -> Result<String, ModelError>;
}

#[async_trait]
impl VisionModel for LlmClient {
    async fn describe(&self, jpeg: &[u8], question: &str) -> Result<String, ModelError> {
        self.describe_image(jpeg, question).await
    }
}

pub struct AskImageTool {
    forum: Arc<dyn Forum>,
    model: Arc<dyn VisionModel>,
}

impl AskImageTool {
    pub fn new(forum: Arc<dyn Forum>, model: Arc<dyn VisionModel>) -> Self {
        Self { forum, model }
    }
}

#[async_trait]
impl Tool for AskImageTool {
    fn name(&self) -> &str {
        "ask_image"
    }

    fn description(&self) -> &str {
        "Ask a question about an image using a vision model. Works with forum upload paths \
         (like /assets/uploads/...) and full image URLs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Image URL or forum-relative path"
                },
                "question": {
                    "type": "string",
                    "description": "What you want to know about the image"
                }
            },
            "required": ["url", "question"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        let question = params
            .get("question")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if url.is_empty() || question.is_empty() {
            return Ok(ToolOutput::Error(
                "Both 'url' and 'question' must be non-empty".to_string(),
            ));
        }

        tracing::info!("Asking '{}' about {}", question, url);
        let bytes = self
            .forum
            .download(url)
            .await
            .with_context(|| format!("Failed to download image {}", url))?;
        let jpeg = encode_jpeg(&bytes)?;
        let answer = self.model.describe(&jpeg, question).await?;
        tracing::debug!("Vision answer: {}", answer);
        Ok(ToolOutput::Text(answer))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Media
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeForum;
    use std::sync::Mutex;

    fn png_with_alpha() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(3, 2, image::Rgba([0, 128, 255, 100]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[derive(Default)]
    struct RecordingVision {
        seen: Mutex<Vec<(usize, String)>>,
    }

    #[async_trait]
    impl VisionModel for RecordingVision {
        async fn describe(&self, jpeg: &[u8], question: &str) -> Result<String, ModelError> {
            assert_eq!(
                image::guess_format(jpeg).unwrap(),
                image::ImageFormat::Jpeg
            );
            self.seen.lock().unwrap().push((jpeg.len(), question.to_string()));
            Ok("a blue rectangle".to_string())
        }
    }

    #[test]
    fn converts_rgba_png_to_jpeg() {
        let jpeg = encode_jpeg(&png_with_alpha()).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        assert!(encode_jpeg(b"definitely not an image").is_err());
    }

    #[tokio::test]
    async fn downloads_converts_and_asks() {
        let forum = FakeForum::default();
        forum
            .media
            .lock()
            .unwrap()
            .insert("/assets/uploads/pic.png".to_string(), png_with_alpha());
        let vision = Arc::new(RecordingVision::default());
        let tool = AskImageTool::new(Arc::new(forum), vision.clone());

        let out = tool
            .execute(
                json!({"url": "/assets/uploads/pic.png", "question": "what shape?"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::Text("a blue rectangle".to_string()));
        assert_eq!(vision.seen.lock().unwrap()[0].1, "what shape?");
    }

    #[tokio::test]
    async fn missing_image_is_an_execution_error() {
        let tool = AskImageTool::new(
            Arc::new(FakeForum::default()),
            Arc::new(RecordingVision::default()),
        );
        let err = tool
            .execute(
                json!({"url": "/nope.png", "question": "?"}),
                &ToolContext::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nope.png"));
    }
}
