//! Embedding storage. One row per (asset, modality); re-runs overwrite in place.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{bytes_to_vector, now, vector_to_bytes, Database};

/// Modality of the whole-image embedding that feeds the search index.
pub const IMAGE_MODALITY: &str = "image";

/// Modality key for one video segment's keyframe embedding.
pub fn video_modality(segment_id: i64) -> String {
    format!("video:{}", segment_id)
}

/// Embedding record from the database
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub asset_id: i64,
    pub modality: String,
    pub vector: Vec<f32>,
    pub model_name: String,
    pub model_version: String,
    pub device: String,
}

impl Database {
    pub fn store_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO embeddings (asset_id, modality, vector, dim, model_name,
                                    model_version, device, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(asset_id, modality) DO UPDATE SET
                vector = excluded.vector,
                dim = excluded.dim,
                model_name = excluded.model_name,
                model_version = excluded.model_version,
                device = excluded.device,
                updated_at = excluded.updated_at
            "#,
            params![
                record.asset_id,
                record.modality,
                vector_to_bytes(&record.vector),
                record.vector.len() as i64,
                record.model_name,
                record.model_version,
                record.device,
                now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_embedding(&self, asset_id: i64, modality: &str) -> Result<Option<EmbeddingRecord>> {
        let record = self
            .conn()?
            .query_row(
                r#"
                SELECT asset_id, modality, vector, model_name, model_version, device
                FROM embeddings WHERE asset_id = ? AND modality = ?
                "#,
                params![asset_id, modality],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All embeddings of one modality, ordered by asset id.
    pub fn embeddings_by_modality(&self, modality: &str) -> Result<Vec<EmbeddingRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT asset_id, modality, vector, model_name, model_version, device
            FROM embeddings WHERE modality = ?
            ORDER BY asset_id ASC
            "#,
        )?;
        let records = stmt
            .query_map([modality], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_embeddings(&self) -> Result<i64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_embeddings_by_modality(&self, modality: &str) -> Result<i64> {
        let count = self.conn()?.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE modality = ?",
            [modality],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Timestamp of the most recent write for a modality, if any.
    pub fn latest_embedding_update(&self, modality: &str) -> Result<Option<String>> {
        let latest = self.conn()?.query_row(
            "SELECT MAX(updated_at) FROM embeddings WHERE modality = ?",
            [modality],
            |row| row.get(0),
        )?;
        Ok(latest)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<EmbeddingRecord> {
    let bytes: Vec<u8> = row.get(2)?;
    Ok(EmbeddingRecord {
        asset_id: row.get(0)?,
        modality: row.get(1)?,
        vector: bytes_to_vector(&bytes),
        model_name: row.get(3)?,
        model_version: row.get(4)?,
        device: row.get(5)?,
    })
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
