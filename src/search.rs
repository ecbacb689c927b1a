//! Content and metadata search over ingested assets.

use anyhow::Result;

use crate::context::AppContext;
use crate::db::embeddings::IMAGE_MODALITY;
use crate::db::Asset;
use crate::error::TaskError;

/// A search hit joined with its asset row
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub asset: Asset,
    pub score: f32,
}

fn join_hits(ctx: &AppContext, hits: Vec<crate::index::SearchHit>) -> Result<Vec<SearchResult>> {
    let mut results = Vec::with_capacity(hits.len());
    for hit in hits {
        // Ids whose asset row is gone stay in the index until the next rebuild.
        if let Some(asset) = ctx.db.get_asset(hit.id)? {
            results.push(SearchResult {
                asset,
                score: hit.score,
            });
        }
    }
    Ok(results)
}

/// Embed `text` and return the `k` nearest images.
pub fn search_by_text(ctx: &AppContext, text: &str, k: usize) -> Result<Vec<SearchResult>> {
    let query = ctx.providers.embedding.embed_text(text)?;
    let hits = ctx.index.search(&query, k)?;
    join_hits(ctx, hits)
}

/// Images nearest to an already embedded asset, excluding the asset itself.
pub fn search_similar(ctx: &AppContext, asset_id: i64, k: usize) -> Result<Vec<SearchResult>> {
    let record = ctx
        .db
        .get_embedding(asset_id, IMAGE_MODALITY)?
        .ok_or_else(|| TaskError::not_found("embedding for asset", asset_id))?;
    let hits = ctx
        .index
        .search(&record.vector, k + 1)?
        .into_iter()
        .filter(|hit| hit.id != asset_id)
        .take(k)
        .collect();
    join_hits(ctx, hits)
}

/// Substring match over file names, directories and captions.
pub fn search_metadata(ctx: &AppContext, needle: &str, limit: usize) -> Result<Vec<Asset>> {
    ctx.db.search_assets(needle, limit)
}

/// Replace the index contents with every stored image embedding.
///
/// Returns the number of vectors loaded. Embeddings whose dimension differs
/// from the first one (a model change mid-library) are skipped.
pub fn rebuild_index(ctx: &AppContext) -> Result<usize> {
    let records = ctx.db.embeddings_by_modality(IMAGE_MODALITY)?;
    let dim = records.first().map(|r| r.vector.len());

    let mut ids = Vec::with_capacity(records.len());
    let mut vectors = Vec::with_capacity(records.len());
    let mut skipped = 0;
    for record in records {
        if Some(record.vector.len()) == dim {
            ids.push(record.asset_id);
            vectors.push(record.vector);
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        tracing::warn!(skipped, "Skipped embeddings with a different dimension");
    }

    ctx.index.rebuild(&ids, &vectors)?;
    Ok(ids.len())
}
