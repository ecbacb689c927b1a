use anyhow::Result;
use std::path::Path;
use tracing::{debug, warn};

use super::load_asset;
use crate::context::AppContext;
use crate::db::Asset;
use crate::media::{calculate_perceptual_hash, ThumbnailManager};
use crate::tasks::{HandlerOutcome, TaskContext, TaskHandler, TaskKind};

/// Model name recorded for captions built without a provider.
pub const HEURISTIC_CAPTION_MODEL: &str = "heuristic";

/// `{asset_id}`: cached JPEG thumbnail plus the image dimensions.
pub struct ThumbHandler;

impl TaskHandler for ThumbHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Thumb
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let (asset, path) = load_asset(ctx, task)?;
        let manager = ThumbnailManager::new(&ctx.config.thumbnails);
        let thumb = manager.generate(&path, asset.sha256_hash.as_deref())?;

        let (width, height) = image::image_dimensions(&path)?;
        ctx.db.set_asset_dimensions(asset.id, width, height)?;
        ctx.db.set_thumbnail_path(asset.id, &thumb.to_string_lossy())?;
        debug!(asset_id = asset.id, thumb = %thumb.display(), "Thumbnail ready");
        Ok(HandlerOutcome::Done)
    }
}

/// `{asset_id}`: perceptual hash for near-duplicate detection.
pub struct PhashHandler;

impl TaskHandler for PhashHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Phash
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let (asset, path) = load_asset(ctx, task)?;
        let hash = calculate_perceptual_hash(&path)?;
        ctx.db.set_perceptual_hash(asset.id, &hash)?;
        Ok(HandlerOutcome::Done)
    }
}

/// `{asset_id}`: provider caption, or a heuristic one when the provider fails.
pub struct CaptionHandler;

impl TaskHandler for CaptionHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Caption
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let (asset, path) = load_asset(ctx, task)?;
        let provider = &ctx.providers.caption;

        let (caption, model) = match provider.generate_caption(&path) {
            Ok(caption) => (caption, provider.model_name().to_string()),
            Err(e) => {
                warn!(asset_id = asset.id, error = %format!("{:#}", e), "Caption provider failed, using heuristic");
                (heuristic_caption(&asset, &path), HEURISTIC_CAPTION_MODEL.to_string())
            }
        };

        ctx.db.set_caption(asset.id, &caption, &model)?;
        Ok(HandlerOutcome::Done)
    }
}

/// File stem with separators turned into spaces, plus the pixel size when known.
pub fn heuristic_caption(asset: &Asset, path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| asset.filename.clone());
    let words = stem
        .split(|c: char| c == '_' || c == '-' || c == '.')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let dimensions = match (asset.width, asset.height) {
        (Some(w), Some(h)) => Some((w, h)),
        _ => image::image_dimensions(path).ok(),
    };

    match dimensions {
        Some((w, h)) => format!("{} ({}x{} {})", words, w, h, asset.media_type),
        None => format!("{} ({})", words, asset.media_type),
    }
}
