use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;
use tracing::{debug, info};

use super::enqueue_for_asset;
use crate::context::AppContext;
use crate::db::assets::UpsertOutcome;
use crate::db::{MediaType, NewAsset};
use crate::error::TaskError;
use crate::media::{calculate_sha256, classify_path, discover_media};
use crate::tasks::{HandlerOutcome, TaskContext, TaskHandler, TaskKind};

const IMAGE_FOLLOW_UPS: [TaskKind; 5] = [
    TaskKind::Thumb,
    TaskKind::Phash,
    TaskKind::Embed,
    TaskKind::Caption,
    TaskKind::Face,
];

/// `{path}`: a directory fans out into one ingest per media file; a file is
/// recorded as an asset and, when its content is new, gets derived-data tasks.
pub struct IngestHandler;

impl TaskHandler for IngestHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Ingest
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let path = Path::new(task.task.payload_str("path")?);

        if path.is_dir() {
            let files = discover_media(path, &ctx.config.ingest)?;
            let mut queued = 0;
            for file in &files {
                let payload = json!({ "path": file.to_string_lossy() });
                if ctx.db.enqueue_unique(TaskKind::Ingest, &payload, None)?.is_some() {
                    queued += 1;
                }
            }
            info!(dir = %path.display(), found = files.len(), queued, "Queued directory for ingest");
            return Ok(HandlerOutcome::Done);
        }

        if !path.is_file() {
            return Err(TaskError::InvalidPayload(format!("{} does not exist", path.display())).into());
        }

        let media_type = classify_path(path, &ctx.config.ingest).ok_or_else(|| {
            TaskError::InvalidPayload(format!("{} is not a supported media file", path.display()))
        })?;
        ingest_file(ctx, path, media_type)?;
        Ok(HandlerOutcome::Done)
    }
}

fn ingest_file(ctx: &AppContext, path: &Path, media_type: MediaType) -> Result<UpsertOutcome> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let sha256 = calculate_sha256(path)
        .with_context(|| format!("Failed to hash {}", path.display()))?;

    let outcome = ctx.db.upsert_asset(&NewAsset {
        path: path.to_string_lossy().to_string(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        directory: path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        media_type,
        size_bytes: metadata.len() as i64,
        sha256_hash: Some(sha256),
    })?;

    if !outcome.is_new_content() {
        debug!(asset_id = outcome.id(), path = %path.display(), "Asset unchanged");
        return Ok(outcome);
    }

    match media_type {
        MediaType::Image => enqueue_for_asset(ctx, &IMAGE_FOLLOW_UPS, outcome.id())?,
        MediaType::Video => enqueue_for_asset(ctx, &[TaskKind::VideoScenes], outcome.id())?,
    }
    info!(asset_id = outcome.id(), %media_type, path = %path.display(), "Ingested asset");
    Ok(outcome)
}
