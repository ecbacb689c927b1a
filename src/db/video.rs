use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{now, Database};

/// One scene of a video asset
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSegmentRecord {
    pub id: i64,
    pub asset_id: i64,
    pub segment_index: i64,
    pub start_ms: i64,
    pub end_ms: i64,
    pub keyframe_path: Option<String>,
}

impl Database {
    /// Replace all segments of an asset. Returns the new segment ids in order.
    pub fn replace_video_segments(
        &self,
        asset_id: i64,
        segments: &[(i64, i64, Option<String>)],
    ) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM video_segments WHERE asset_id = ?", [asset_id])?;
        tx.execute(
            "DELETE FROM embeddings WHERE asset_id = ? AND modality LIKE 'video:%'",
            [asset_id],
        )?;

        let created = now();
        let mut ids = Vec::with_capacity(segments.len());
        for (index, (start_ms, end_ms, keyframe)) in segments.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO video_segments (asset_id, segment_index, start_ms, end_ms, keyframe_path, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                params![asset_id, index as i64, start_ms, end_ms, keyframe, created],
            )?;
            ids.push(tx.last_insert_rowid());
        }

        tx.commit()?;
        Ok(ids)
    }

    pub fn get_video_segment(&self, segment_id: i64) -> Result<Option<VideoSegmentRecord>> {
        let segment = self
            .conn()?
            .query_row(
                r#"
                SELECT id, asset_id, segment_index, start_ms, end_ms, keyframe_path
                FROM video_segments WHERE id = ?
                "#,
                [segment_id],
                |row| {
                    Ok(VideoSegmentRecord {
                        id: row.get(0)?,
                        asset_id: row.get(1)?,
                        segment_index: row.get(2)?,
                        start_ms: row.get(3)?,
                        end_ms: row.get(4)?,
                        keyframe_path: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(segment)
    }

    pub fn count_video_segments(&self, asset_id: i64) -> Result<i64> {
        let count = self.conn()?.query_row(
            "SELECT COUNT(*) FROM video_segments WHERE asset_id = ?",
            [asset_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
