//! Inference backends behind narrow traits.
//!
//! Handlers only see these traits. Failures surface as `anyhow` errors carrying
//! a [`TaskError`](crate::error::TaskError) category so the executor can decide
//! between retry and dead-letter.

pub mod openai;
pub mod placeholder;

use anyhow::Result;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ProviderConfig, ProviderKind};
use crate::db::BoundingBox;

pub use openai::OpenAICompatibleProvider;
pub use placeholder::{
    HistogramEmbedder, PixelFaceEmbedder, PlaceholderCaptioner, NoFaceDetector, WholeFileSegmenter,
};

pub trait CaptionProvider: Send + Sync {
    fn generate_caption(&self, image_path: &Path) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// A detection with its score, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

pub trait FaceDetectionProvider: Send + Sync {
    fn detect(&self, image_path: &Path) -> Result<Vec<FaceBox>>;
}

pub trait FaceEmbeddingProvider: Send + Sync {
    /// Fixed-dimension unit vector for a cropped face.
    fn embed_face(&self, face: &DynamicImage) -> Result<Vec<f32>>;
}

pub trait EmbeddingService: Send + Sync {
    fn embed_image(&self, image_path: &Path) -> Result<Vec<f32>>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;

    fn model_version(&self) -> &str;

    fn device(&self) -> &str;
}

/// A scene of a video, with an optional extracted keyframe image.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSegment {
    pub start_ms: i64,
    pub end_ms: i64,
    pub keyframe: Option<PathBuf>,
}

pub trait VideoSegmenter: Send + Sync {
    fn segments(&self, video_path: &Path) -> Result<Vec<VideoSegment>>;
}

/// The provider set shared by all handlers.
#[derive(Clone)]
pub struct Providers {
    pub caption: Arc<dyn CaptionProvider>,
    pub face_detection: Arc<dyn FaceDetectionProvider>,
    pub face_embedding: Arc<dyn FaceEmbeddingProvider>,
    pub embedding: Arc<dyn EmbeddingService>,
    pub video: Arc<dyn VideoSegmenter>,
}

impl Providers {
    /// Local providers only: deterministic, no network, no model files.
    pub fn placeholder() -> Self {
        Self {
            caption: Arc::new(PlaceholderCaptioner),
            face_detection: Arc::new(NoFaceDetector),
            face_embedding: Arc::new(PixelFaceEmbedder),
            embedding: Arc::new(HistogramEmbedder),
            video: Arc::new(WholeFileSegmenter),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        match config.kind {
            ProviderKind::Placeholder => Self::placeholder(),
            ProviderKind::OpenAI => {
                let remote = Arc::new(OpenAICompatibleProvider::from_config(config));
                tracing::info!(
                    endpoint = %config.endpoint,
                    model = %config.model,
                    "Using OpenAI-compatible provider"
                );
                Self {
                    caption: remote.clone(),
                    face_detection: remote.clone(),
                    embedding: remote,
                    ..Self::placeholder()
                }
            }
        }
    }
}
