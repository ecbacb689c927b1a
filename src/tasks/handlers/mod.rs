//! One handler per task kind.

mod embed;
mod faces;
mod ingest;
mod media;
mod video;

use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::{TaskContext, TaskHandler, TaskKind};
use crate::context::AppContext;
use crate::db::Asset;
use crate::error::TaskError;

pub use embed::EmbedHandler;
pub use faces::{FaceEmbedHandler, FaceHandler, PersonClusterHandler, PersonReclusterHandler};
pub use ingest::IngestHandler;
pub use media::{CaptionHandler, PhashHandler, ThumbHandler};
pub use video::{VideoEmbedHandler, VideoScenesHandler};

/// Maps each task kind to its handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in handler for every kind.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(IngestHandler);
        registry.register(ThumbHandler);
        registry.register(PhashHandler);
        registry.register(EmbedHandler);
        registry.register(CaptionHandler);
        registry.register(FaceHandler);
        registry.register(FaceEmbedHandler);
        registry.register(PersonClusterHandler);
        registry.register(PersonReclusterHandler);
        registry.register(VideoScenesHandler);
        registry.register(VideoEmbedHandler);
        registry
    }

    /// Register a handler, replacing any previous one for its kind.
    pub fn register<H: TaskHandler + 'static>(&mut self, handler: H) {
        let kind = handler.kind();
        tracing::debug!(%kind, "Registered task handler");
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// The asset named by the task's `asset_id`, whose file must still exist.
fn load_asset(ctx: &AppContext, task: &TaskContext) -> Result<(Asset, PathBuf)> {
    let asset_id = task.task.payload_i64("asset_id")?;
    let asset = ctx
        .db
        .get_asset(asset_id)?
        .ok_or_else(|| TaskError::not_found("asset", asset_id))?;
    let path = PathBuf::from(&asset.path);
    if !path.is_file() {
        return Err(TaskError::not_found("file for asset", asset_id).into());
    }
    Ok((asset, path))
}

/// Queue follow-up work for an asset, skipping kinds already pending for it.
fn enqueue_for_asset(ctx: &AppContext, kinds: &[TaskKind], asset_id: i64) -> Result<()> {
    for &kind in kinds {
        ctx.db
            .enqueue_unique(kind, &json!({ "asset_id": asset_id }), None)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_kind() {
        assert_eq!(HandlerRegistry::standard().kinds(), TaskKind::ALL.to_vec());
        assert!(HandlerRegistry::new().get(TaskKind::Embed).is_none());
    }
}
