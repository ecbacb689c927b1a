//! OpenAI-compatible HTTP provider (works with LM Studio, Ollama's /v1 and OpenAI).

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use super::{CaptionProvider, EmbeddingService, FaceBox, FaceDetectionProvider};
use crate::config::ProviderConfig;
use crate::db::BoundingBox;
use crate::error::{from_http, TaskError};

const CAPTION_PROMPT: &str = "Describe this image in one or two sentences. Mention the main \
     subject, the setting and any visible text. Reply with the description only.";

const FACE_PROMPT: &str = r#"Detect every human face in this image.
Return JSON in exactly this format, with boxes as percentages (0-100) of the image size:
{"faces": [{"x_percent": 0, "y_percent": 0, "width_percent": 0, "height_percent": 0, "confidence": 0.0}]}
If there are no faces, return {"faces": []}. Return ONLY the JSON."#;

pub struct OpenAICompatibleProvider {
    endpoint: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct FaceDetectionResponse {
    faces: Vec<PercentBox>,
}

#[derive(Debug, Deserialize)]
struct PercentBox {
    x_percent: f32,
    y_percent: f32,
    width_percent: f32,
    height_percent: f32,
    #[serde(default)]
    confidence: f32,
}

impl OpenAICompatibleProvider {
    pub fn from_config(config: &ProviderConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            api_key: config.api_key.clone(),
            agent,
        }
    }

    fn post(&self, route: &str) -> ureq::Request {
        let url = format!("{}/{}", self.endpoint, route);
        let mut req = self.agent.post(&url).set("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }
        req
    }

    fn chat_with_image(&self, image_path: &Path, prompt: &str, max_tokens: u32) -> Result<String> {
        let base64_image = load_and_encode_image(image_path, 1024)?;
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: prompt.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:image/jpeg;base64,{}", base64_image),
                        },
                    },
                ],
            }],
            max_tokens,
            temperature: 0.3,
        };

        let response: ChatResponse = self
            .post("chat/completions")
            .send_json(&request)
            .map_err(from_http)
            .context("Chat completion request failed")?
            .into_json()
            .map_err(|e| TaskError::Provider(format!("unreadable chat response: {}", e)))?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| TaskError::Provider("chat response had no choices".into()).into())
    }
}

impl CaptionProvider for OpenAICompatibleProvider {
    fn generate_caption(&self, image_path: &Path) -> Result<String> {
        let caption = self.chat_with_image(image_path, CAPTION_PROMPT, 200)?;
        if caption.is_empty() {
            return Err(TaskError::Provider("empty caption".into()).into());
        }
        Ok(caption)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

impl FaceDetectionProvider for OpenAICompatibleProvider {
    fn detect(&self, image_path: &Path) -> Result<Vec<FaceBox>> {
        let (width, height) = image::image_dimensions(image_path)
            .with_context(|| format!("Failed to read dimensions of {}", image_path.display()))?;
        let content = self.chat_with_image(image_path, FACE_PROMPT, 1000)?;
        let parsed: FaceDetectionResponse = serde_json::from_str(extract_json(&content))
            .map_err(|e| TaskError::Provider(format!("unparseable face detection JSON: {}", e)))?;

        Ok(parsed
            .faces
            .iter()
            .map(|face| percent_to_pixels(face, width, height))
            .filter(|face| face.bbox.width > 0 && face.bbox.height > 0)
            .collect())
    }
}

impl EmbeddingService for OpenAICompatibleProvider {
    /// Images are embedded through their caption so that image and text
    /// vectors share the text embedding space.
    fn embed_image(&self, image_path: &Path) -> Result<Vec<f32>> {
        let caption = self.generate_caption(image_path)?;
        self.embed_text(&caption)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
        };

        let response: EmbeddingResponse = self
            .post("embeddings")
            .send_json(&request)
            .map_err(from_http)
            .context("Embedding request failed")?
            .into_json()
            .map_err(|e| TaskError::Provider(format!("unreadable embedding response: {}", e)))?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| TaskError::Provider("no embedding in response".into()).into())
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    fn model_version(&self) -> &str {
        "api"
    }

    fn device(&self) -> &str {
        "remote"
    }
}

fn percent_to_pixels(face: &PercentBox, width: u32, height: u32) -> FaceBox {
    let scale = |percent: f32, size: u32| ((percent.clamp(0.0, 100.0) / 100.0) * size as f32) as i32;
    FaceBox {
        bbox: BoundingBox {
            x: scale(face.x_percent, width),
            y: scale(face.y_percent, height),
            width: scale(face.width_percent, width),
            height: scale(face.height_percent, height),
        },
        confidence: face.confidence.clamp(0.0, 1.0),
    }
}

/// Load an image, shrink it to fit `max_dimension`, re-encode as JPEG and base64 it.
fn load_and_encode_image(image_path: &Path, max_dimension: u32) -> Result<String> {
    let img = image::open(image_path)
        .with_context(|| format!("Failed to open image {}", image_path.display()))?;

    let (width, height) = img.dimensions();
    let img = if width > max_dimension || height > max_dimension {
        img.resize(max_dimension, max_dimension, image::imageops::FilterType::Triangle)
    } else {
        img
    };

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    img.to_rgb8()
        .write_with_encoder(encoder)
        .context("Failed to encode image as JPEG")?;

    Ok(BASE64.encode(buf.into_inner()))
}

/// Strip a surrounding markdown code fence, if any.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    if trimmed.starts_with("```") {
        if let Some(start) = trimmed.find('\n') {
            let body = &trimmed[start + 1..];
            if let Some(end) = body.rfind("```") {
                return body[..end].trim();
            }
        }
    }
    trimmed
}
