//! Local providers that need no model files or network.
//!
//! Their vectors are crude (colour histograms, downscaled pixels) but
//! deterministic, so the pipeline can run end to end on any machine.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use sha2::{Digest, Sha256};
use std::path::Path;

use super::{
    CaptionProvider, EmbeddingService, FaceBox, FaceDetectionProvider, FaceEmbeddingProvider,
    VideoSegment, VideoSegmenter,
};
use crate::index::normalize;

/// Bins per colour channel; the embedding has `BINS^3` dimensions.
const BINS: usize = 8;
const HISTOGRAM_DIM: usize = BINS * BINS * BINS;
const FACE_SIDE: u32 = 16;

/// Named colours recognised in text queries, with their RGB anchor.
const COLOR_WORDS: &[(&str, [u8; 3])] = &[
    ("black", [0, 0, 0]),
    ("white", [255, 255, 255]),
    ("gray", [128, 128, 128]),
    ("grey", [128, 128, 128]),
    ("red", [220, 30, 30]),
    ("green", [40, 160, 40]),
    ("blue", [30, 60, 220]),
    ("yellow", [230, 220, 40]),
    ("orange", [240, 140, 20]),
    ("purple", [130, 40, 160]),
    ("pink", [240, 150, 190]),
    ("brown", [120, 70, 30]),
];

fn bin_of(pixel: [u8; 3]) -> usize {
    let q = |v: u8| v as usize * BINS / 256;
    (q(pixel[0]) * BINS + q(pixel[1])) * BINS + q(pixel[2])
}

fn color_name(pixel: [u8; 3]) -> &'static str {
    COLOR_WORDS
        .iter()
        .filter(|(name, _)| *name != "grey")
        .min_by_key(|(_, rgb)| {
            rgb.iter()
                .zip(pixel.iter())
                .map(|(a, b)| (*a as i32 - *b as i32).pow(2))
                .sum::<i32>()
        })
        .map(|(name, _)| *name)
        .unwrap_or("gray")
}

/// Normalized RGB histogram over a downscaled copy of the image.
pub fn color_histogram(img: &DynamicImage) -> Vec<f32> {
    let small = img.resize(64, 64, FilterType::Triangle).to_rgb8();
    let mut histogram = vec![0f32; HISTOGRAM_DIM];
    for pixel in small.pixels() {
        histogram[bin_of(pixel.0)] += 1.0;
    }
    normalize(&mut histogram);
    histogram
}

/// Describes the dominant colour and orientation.
pub struct PlaceholderCaptioner;

impl CaptionProvider for PlaceholderCaptioner {
    fn generate_caption(&self, image_path: &Path) -> Result<String> {
        let img = image::open(image_path)
            .with_context(|| format!("Failed to open image {}", image_path.display()))?;
        let (width, height) = img.dimensions();
        let avg = img.resize_exact(1, 1, FilterType::Triangle).to_rgb8();
        let dominant = color_name(avg.get_pixel(0, 0).0);

        let shape = if width > height {
            "landscape"
        } else if height > width {
            "portrait"
        } else {
            "square"
        };
        Ok(format!("A mostly {} {} image", dominant, shape))
    }

    fn model_name(&self) -> &str {
        "placeholder-color"
    }
}

/// Colour histogram for images; colour words and hashed tokens for text.
pub struct HistogramEmbedder;

impl EmbeddingService for HistogramEmbedder {
    fn embed_image(&self, image_path: &Path) -> Result<Vec<f32>> {
        let img = image::open(image_path)
            .with_context(|| format!("Failed to open image {}", image_path.display()))?;
        Ok(color_histogram(&img))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0f32; HISTOGRAM_DIM];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
        {
            match COLOR_WORDS.iter().find(|(name, _)| *name == token) {
                Some((_, rgb)) => vector[bin_of(*rgb)] += 1.0,
                None => {
                    let digest = Sha256::digest(token.as_bytes());
                    let slot = u16::from_le_bytes([digest[0], digest[1]]) as usize % HISTOGRAM_DIM;
                    vector[slot] += 0.25;
                }
            }
        }
        normalize(&mut vector);
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        "placeholder-histogram"
    }

    fn model_version(&self) -> &str {
        "1"
    }

    fn device(&self) -> &str {
        "cpu"
    }
}

/// Finds nothing. Stands in until a detection model is configured.
pub struct NoFaceDetector;

impl FaceDetectionProvider for NoFaceDetector {
    fn detect(&self, _image_path: &Path) -> Result<Vec<FaceBox>> {
        Ok(Vec::new())
    }
}

/// Mean-centred 16x16 grayscale pixels.
pub struct PixelFaceEmbedder;

impl FaceEmbeddingProvider for PixelFaceEmbedder {
    fn embed_face(&self, face: &DynamicImage) -> Result<Vec<f32>> {
        let gray = face
            .resize_exact(FACE_SIDE, FACE_SIDE, FilterType::Triangle)
            .to_luma8();
        let mut vector: Vec<f32> = gray.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        let mean = vector.iter().sum::<f32>() / vector.len() as f32;
        for v in vector.iter_mut() {
            *v -= mean;
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

/// One segment spanning the whole file, without a keyframe.
pub struct WholeFileSegmenter;

impl VideoSegmenter for WholeFileSegmenter {
    fn segments(&self, video_path: &Path) -> Result<Vec<VideoSegment>> {
        std::fs::metadata(video_path)
            .with_context(|| format!("Failed to stat video {}", video_path.display()))?;
        Ok(vec![VideoSegment {
            start_ms: 0,
            end_ms: 0,
            keyframe: None,
        }])
    }
}
