use anyhow::Result;
use tracing::debug;

use super::load_asset;
use crate::context::AppContext;
use crate::db::embeddings::IMAGE_MODALITY;
use crate::db::EmbeddingRecord;
use crate::tasks::{HandlerOutcome, TaskContext, TaskHandler, TaskKind};

/// `{asset_id}`: whole-image embedding, stored and added to the search index.
pub struct EmbedHandler;

impl TaskHandler for EmbedHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Embed
    }

    fn run(&self, ctx: &AppContext, task: &TaskContext) -> Result<HandlerOutcome> {
        let (asset, path) = load_asset(ctx, task)?;
        let service = &ctx.providers.embedding;
        let vector = service.embed_image(&path)?;

        ctx.db.store_embedding(&EmbeddingRecord {
            asset_id: asset.id,
            modality: IMAGE_MODALITY.to_string(),
            vector: vector.clone(),
            model_name: service.model_name().to_string(),
            model_version: service.model_version().to_string(),
            device: service.device().to_string(),
        })?;
        ctx.index.add(&[asset.id], &[vector])?;

        debug!(asset_id = asset.id, model = service.model_name(), "Stored image embedding");
        Ok(HandlerOutcome::Done)
    }
}
