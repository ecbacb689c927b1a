use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;
use tracing::{debug, info};

use super::load_asset;
use crate::context::AppContext;
use crate::db::DetectedFace;
use crate::error::TaskError;
use crate::faces::{cluster_unassigned, crop_face, recluster_all};
use crate::index::normalize;
use crate::tasks::trigger::{should_cluster, should_recluster};
use crate::tasks::{HandlerOutcome, TaskContext, TaskHandler, TaskKind};

/// Queue an incremental clustering pass once enough faces are waiting.
fn maybe_enqueue_cluster(ctx: &AppContext) -> Result<()> {
    let unassigned = ctx.db.count_unassigned_embedded_faces()?;
    if should_cluster(unassigned, ctx.config.clustering.min_unassigned_faces) {
        if let Some(id) = ctx.db.enqueue_unique(TaskKind::PersonCluster, &json!({}), None)? {
            debug!(task_id = id, unassigned, "Queued person clustering");
        }
    }
    Ok(())
}

/// `{asset_id}`: detect faces, replacing earlier detections, and queue their embeddings.
pub struct FaceHandler;

impl TaskHandler for FaceHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Face
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let (asset, path) = load_asset(ctx, task)?;
        let detections = ctx.providers.face_detection.detect(&path)?;

        let faces: Vec<DetectedFace> = detections
            .iter()
            .map(|d| DetectedFace {
                bbox: d.bbox,
                confidence: Some(d.confidence),
            })
            .collect();
        let face_ids = ctx.db.replace_faces(asset.id, &faces)?;

        for face_id in &face_ids {
            ctx.db
                .enqueue_unique(TaskKind::FaceEmbed, &json!({ "face_id": face_id }), None)?;
        }

        debug!(asset_id = asset.id, faces = face_ids.len(), "Detected faces");
        Ok(HandlerOutcome::Done)
    }
}

/// `{face_id}`: embed the cropped face.
pub struct FaceEmbedHandler;

impl TaskHandler for FaceEmbedHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::FaceEmbed
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let face_id = task.task.payload_i64("face_id")?;
        // Re-detection deletes faces whose embed tasks may still be queued.
        let Some(face) = ctx.db.get_face(face_id)? else {
            debug!(face_id, "Face no longer exists, nothing to embed");
            return Ok(HandlerOutcome::Done);
        };
        let asset = ctx
            .db
            .get_asset(face.asset_id)?
            .ok_or_else(|| TaskError::not_found("asset", face.asset_id))?;

        let path = Path::new(&asset.path);
        if !path.is_file() {
            return Err(TaskError::not_found("file for asset", asset.id).into());
        }
        let img = image::open(path)
            .with_context(|| format!("Failed to open image {}", path.display()))?;
        let crop = crop_face(&img, &face.bbox).ok_or_else(|| {
            TaskError::InvalidPayload(format!("face {} lies outside its image", face_id))
        })?;

        let mut embedding = ctx.providers.face_embedding.embed_face(&crop)?;
        normalize(&mut embedding);
        ctx.db.set_face_embedding(face_id, &embedding)?;

        maybe_enqueue_cluster(ctx)?;
        Ok(HandlerOutcome::Done)
    }
}

/// `{}`: assign waiting faces to persons, queueing a full recluster when the
/// person count crosses a multiple of `recluster_every_persons`.
pub struct PersonClusterHandler;

impl TaskHandler for PersonClusterHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::PersonCluster
    }

    fn run(&self, ctx: &AppContext, _task: &TaskContext) -> Result<HandlerOutcome> {
        let config = &ctx.config.clustering;
        let persons_before = ctx.db.count_persons()?;
        let outcome = cluster_unassigned(&ctx.db, config)?;

        if should_recluster(
            persons_before,
            outcome.persons_created,
            config.recluster_every_persons,
        ) {
            if let Some(id) = ctx
                .db
                .enqueue_unique(TaskKind::PersonRecluster, &json!({}), None)?
            {
                info!(task_id = id, persons_before, "Queued full recluster");
            }
        }
        Ok(HandlerOutcome::Done)
    }
}

/// `{batch_limit?}`: rebuild every person from scratch. Cancelable.
pub struct PersonReclusterHandler;

impl TaskHandler for PersonReclusterHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::PersonRecluster
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let mut config = ctx.config.clustering.clone();
        if let Some(limit) = task.task.payload.get("batch_limit") {
            let limit = limit.as_u64().ok_or_else(|| {
                TaskError::InvalidPayload("batch_limit must be a non-negative integer".into())
            })?;
            config.batch_limit = limit as usize;
        }

        let outcome = recluster_all(&ctx.db, &config, task)?;
        if outcome.canceled {
            return Ok(HandlerOutcome::Canceled);
        }

        // Faces beyond the batch limit are left unassigned.
        maybe_enqueue_cluster(ctx)?;
        Ok(HandlerOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::db::BoundingBox;
    use crate::providers::{FaceBox, FaceDetectionProvider, Providers};
    use crate::tasks::TaskState;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Reports the same two boxes for every image.
    struct FixedFaces;

    impl FaceDetectionProvider for FixedFaces {
        fn detect(&self, _image_path: &Path) -> Result<Vec<FaceBox>> {
            Ok(vec![
                FaceBox {
                    bbox: BoundingBox { x: 4, y: 4, width: 20, height: 20 },
                    confidence: 0.98,
                },
                FaceBox {
                    bbox: BoundingBox { x: 40, y: 8, width: 16, height: 16 },
                    confidence: 0.91,
                },
            ])
        }
    }

    fn setup(dir: &Path) -> (AppContext, i64) {
        let providers = Providers {
            face_detection: Arc::new(FixedFaces),
            ..Providers::placeholder()
        };
        let mut ctx = testing::context(dir, providers);
        ctx.config.clustering.min_unassigned_faces = 2;

        let path = dir.join("group.png");
        let img = image::RgbImage::from_fn(64, 40, |x, y| {
            let v = ((x * 7 + y * 13) % 256) as u8;
            image::Rgb([v, v / 2, 255 - v])
        });
        img.save(&path).unwrap();
        testing::run(&ctx, TaskKind::Ingest, json!({ "path": path.to_string_lossy() })).unwrap();
        let id = ctx.db.get_asset_by_path(&path.to_string_lossy()).unwrap().unwrap().id;
        (ctx, id)
    }

    #[test]
    fn test_detect_embed_then_cluster() {
        let dir = tempdir().unwrap();
        let (ctx, asset_id) = setup(dir.path());

        testing::run(&ctx, TaskKind::Face, json!({ "asset_id": asset_id })).unwrap();
        let faces = ctx.db.faces_for_asset(asset_id).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(ctx.db.count_tasks(TaskKind::FaceEmbed, TaskState::Pending).unwrap(), 2);

        testing::run(&ctx, TaskKind::FaceEmbed, json!({ "face_id": faces[0].id })).unwrap();
        assert_eq!(ctx.db.count_tasks(TaskKind::PersonCluster, TaskState::Pending).unwrap(), 0);
        testing::run(&ctx, TaskKind::FaceEmbed, json!({ "face_id": faces[1].id })).unwrap();
        assert_eq!(ctx.db.count_tasks(TaskKind::PersonCluster, TaskState::Pending).unwrap(), 1);

        let embedding = ctx.db.get_face(faces[0].id).unwrap().unwrap().embedding.unwrap();
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        testing::run(&ctx, TaskKind::PersonCluster, json!({})).unwrap();
        assert_eq!(ctx.db.count_unassigned_embedded_faces().unwrap(), 0);
        assert!(ctx.db.count_persons().unwrap() >= 1);
    }

    #[test]
    fn test_redetection_replaces_faces() {
        let dir = tempdir().unwrap();
        let (ctx, asset_id) = setup(dir.path());

        testing::run(&ctx, TaskKind::Face, json!({ "asset_id": asset_id })).unwrap();
        let first: Vec<i64> = ctx.db.faces_for_asset(asset_id).unwrap().iter().map(|f| f.id).collect();
        testing::run(&ctx, TaskKind::Face, json!({ "asset_id": asset_id })).unwrap();
        let second = ctx.db.faces_for_asset(asset_id).unwrap();

        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|f| !first.contains(&f.id)));
    }

    #[test]
    fn test_embed_for_replaced_face_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (ctx, asset_id) = setup(dir.path());

        testing::run(&ctx, TaskKind::Face, json!({ "asset_id": asset_id })).unwrap();
        let stale = ctx.db.faces_for_asset(asset_id).unwrap()[0].id;
        testing::run(&ctx, TaskKind::Face, json!({ "asset_id": asset_id })).unwrap();

        let outcome = testing::run(&ctx, TaskKind::FaceEmbed, json!({ "face_id": stale })).unwrap();
        assert_eq!(outcome, HandlerOutcome::Done);
        assert!(ctx.db.get_face(stale).unwrap().is_none());
        assert!(ctx
            .db
            .faces_for_asset(asset_id)
            .unwrap()
            .iter()
            .all(|f| f.embedding.is_none()));
    }

    #[test]
    fn test_recluster_rejects_bad_batch_limit() {
        let dir = tempdir().unwrap();
        let (ctx, _) = setup(dir.path());
        let err = testing::run(&ctx, TaskKind::PersonRecluster, json!({ "batch_limit": "lots" }))
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<TaskError>(), Some(TaskError::InvalidPayload(_))));
    }
}
