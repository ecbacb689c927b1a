use anyhow::Result;
use serde_json::json;
use std::path::Path;
use tracing::{debug, info};

use super::load_asset;
use crate::context::AppContext;
use crate::db::embeddings::video_modality;
use crate::db::EmbeddingRecord;
use crate::error::TaskError;
use crate::tasks::{HandlerOutcome, TaskContext, TaskHandler, TaskKind};

/// `{asset_id}`: split a video into scenes and queue a keyframe embedding per scene.
pub struct VideoScenesHandler;

impl TaskHandler for VideoScenesHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::VideoScenes
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let (asset, path) = load_asset(ctx, task)?;
        let segments = ctx.providers.video.segments(&path)?;

        let rows: Vec<(i64, i64, Option<String>)> = segments
            .iter()
            .map(|s| {
                (
                    s.start_ms,
                    s.end_ms,
                    s.keyframe.as_ref().map(|k| k.to_string_lossy().to_string()),
                )
            })
            .collect();
        let segment_ids = ctx.db.replace_video_segments(asset.id, &rows)?;

        for segment_id in &segment_ids {
            ctx.db.enqueue_unique(
                TaskKind::VideoEmbed,
                &json!({ "segment_id": segment_id }),
                None,
            )?;
        }

        info!(asset_id = asset.id, segments = segment_ids.len(), "Segmented video");
        Ok(HandlerOutcome::Done)
    }
}

/// `{segment_id}`: embed the scene keyframe under the segment's modality.
pub struct VideoEmbedHandler;

impl TaskHandler for VideoEmbedHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::VideoEmbed
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let segment_id = task.task.payload_i64("segment_id")?;
        let segment = ctx
            .db
            .get_video_segment(segment_id)?
            .ok_or_else(|| TaskError::not_found("video segment", segment_id))?;

        let Some(keyframe) = segment.keyframe_path.as_deref() else {
            debug!(segment_id, "Segment has no keyframe, nothing to embed");
            return Ok(HandlerOutcome::Done);
        };
        let keyframe = Path::new(keyframe);
        if !keyframe.is_file() {
            return Err(TaskError::not_found("keyframe for segment", segment_id).into());
        }

        let service = &ctx.providers.embedding;
        let vector = service.embed_image(keyframe)?;
        ctx.db.store_embedding(&EmbeddingRecord {
            asset_id: segment.asset_id,
            modality: video_modality(segment.id),
            vector,
            model_name: service.model_name().to_string(),
            model_version: service.model_version().to_string(),
            device: service.device().to_string(),
        })?;
        Ok(HandlerOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::providers::{Providers, VideoSegment, VideoSegmenter};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Two scenes; only the first has a keyframe.
    struct TwoScenes {
        keyframe: PathBuf,
    }

    impl VideoSegmenter for TwoScenes {
        fn segments(&self, _video_path: &Path) -> Result<Vec<VideoSegment>> {
            Ok(vec![
                VideoSegment {
                    start_ms: 0,
                    end_ms: 4_000,
                    keyframe: Some(self.keyframe.clone()),
                },
                VideoSegment {
                    start_ms: 4_000,
                    end_ms: 9_500,
                    keyframe: None,
                },
            ])
        }
    }

    #[test]
    fn test_scenes_then_keyframe_embeddings() {
        let dir = tempdir().unwrap();
        let keyframe = dir.path().join("frame0.png");
        testing::write_image(&keyframe, [40, 160, 40], 32, 18);
        let providers = Providers {
            video: Arc::new(TwoScenes { keyframe }),
            ..Providers::placeholder()
        };
        let ctx = testing::context(dir.path(), providers);

        let video = dir.path().join("trip.mp4");
        std::fs::write(&video, b"not really a video").unwrap();
        testing::run(&ctx, TaskKind::Ingest, json!({ "path": video.to_string_lossy() })).unwrap();
        let asset_id = ctx.db.get_asset_by_path(&video.to_string_lossy()).unwrap().unwrap().id;

        testing::run(&ctx, TaskKind::VideoScenes, json!({ "asset_id": asset_id })).unwrap();
        assert_eq!(ctx.db.count_video_segments(asset_id).unwrap(), 2);
        assert_eq!(
            ctx.db.count_tasks(TaskKind::VideoEmbed, crate::tasks::TaskState::Pending).unwrap(),
            2
        );

        let mut stored = 0;
        while let Some(task) = ctx.db.claim_next_task().unwrap() {
            if task.kind != TaskKind::VideoEmbed {
                continue;
            }
            let segment_id = task.payload_i64("segment_id").unwrap();
            VideoEmbedHandler
                .run(&ctx, &TaskContext::new(task, ctx.db.clone()))
                .unwrap();
            if ctx
                .db
                .get_embedding(asset_id, &video_modality(segment_id))
                .unwrap()
                .is_some()
            {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        // Segment embeddings stay out of the image index.
        assert_eq!(ctx.index.len().unwrap(), 0);
    }
}
