use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::str::FromStr;

use super::{now, parse_timestamp, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            other => Err(anyhow::anyhow!("unknown media type '{}'", other)),
        }
    }
}

/// An ingested media file
#[derive(Debug, Clone)]
pub struct Asset {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub media_type: MediaType,
    pub size_bytes: i64,
    pub sha256_hash: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub perceptual_hash: Option<String>,
    pub thumbnail_path: Option<String>,
    pub caption: Option<String>,
    pub caption_model: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Data gathered by discovery before an asset row exists
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub media_type: MediaType,
    pub size_bytes: i64,
    pub sha256_hash: Option<String>,
}

/// Result of recording a discovered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    /// Existing path whose content hash changed; derived data is stale.
    Updated(i64),
    Unchanged(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match *self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => id,
        }
    }

    pub fn is_new_content(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged(_))
    }
}

const ASSET_COLUMNS: &str = "id, path, filename, directory, media_type, size_bytes, sha256_hash, \
     width, height, perceptual_hash, thumbnail_path, caption, caption_model, created_at, updated_at";

impl Database {
    /// Insert a discovered file, or refresh an existing row when its content changed.
    pub fn upsert_asset(&self, asset: &NewAsset) -> Result<UpsertOutcome> {
        let conn = self.conn()?;
        let existing: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, sha256_hash FROM assets WHERE path = ?",
                [&asset.path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((id, hash)) if hash.is_some() && hash == asset.sha256_hash => {
                Ok(UpsertOutcome::Unchanged(id))
            }
            Some((id, _)) => {
                conn.execute(
                    r#"
                    UPDATE assets
                    SET size_bytes = ?, sha256_hash = ?, media_type = ?,
                        width = NULL, height = NULL, perceptual_hash = NULL,
                        thumbnail_path = NULL, caption = NULL, caption_model = NULL,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                    params![
                        asset.size_bytes,
                        asset.sha256_hash,
                        asset.media_type.as_str(),
                        now(),
                        id
                    ],
                )?;
                Ok(UpsertOutcome::Updated(id))
            }
            None => {
                let ts = now();
                conn.execute(
                    r#"
                    INSERT INTO assets (path, filename, directory, media_type, size_bytes,
                                        sha256_hash, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                    params![
                        asset.path,
                        asset.filename,
                        asset.directory,
                        asset.media_type.as_str(),
                        asset.size_bytes,
                        asset.sha256_hash,
                        ts,
                        ts
                    ],
                )?;
                Ok(UpsertOutcome::Inserted(conn.last_insert_rowid()))
            }
        }
    }

    pub fn get_asset(&self, id: i64) -> Result<Option<Asset>> {
        let sql = format!("SELECT {} FROM assets WHERE id = ?", ASSET_COLUMNS);
        let asset = self.conn()?.query_row(&sql, [id], row_to_asset).optional()?;
        Ok(asset)
    }

    pub fn get_asset_by_path(&self, path: &str) -> Result<Option<Asset>> {
        let sql = format!("SELECT {} FROM assets WHERE path = ?", ASSET_COLUMNS);
        let asset = self.conn()?.query_row(&sql, [path], row_to_asset).optional()?;
        Ok(asset)
    }

    pub fn set_asset_dimensions(&self, id: i64, width: u32, height: u32) -> Result<()> {
        self.conn()?.execute(
            "UPDATE assets SET width = ?, height = ?, updated_at = ? WHERE id = ?",
            params![width, height, now(), id],
        )?;
        Ok(())
    }

    pub fn set_thumbnail_path(&self, id: i64, path: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE assets SET thumbnail_path = ?, updated_at = ? WHERE id = ?",
            params![path, now(), id],
        )?;
        Ok(())
    }

    pub fn set_perceptual_hash(&self, id: i64, hash: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE assets SET perceptual_hash = ?, updated_at = ? WHERE id = ?",
            params![hash, now(), id],
        )?;
        Ok(())
    }

    pub fn set_caption(&self, id: i64, caption: &str, model: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE assets SET caption = ?, caption_model = ?, updated_at = ? WHERE id = ?",
            params![caption, model, now(), id],
        )?;
        Ok(())
    }

    /// Case-insensitive substring match over filename, directory and caption.
    pub fn search_assets(&self, query: &str, limit: usize) -> Result<Vec<Asset>> {
        let sql = format!(
            r#"
            SELECT {} FROM assets
            WHERE filename LIKE ?1 OR directory LIKE ?1 OR caption LIKE ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
            ASSET_COLUMNS
        );
        let pattern = format!("%{}%", query);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let assets = stmt
            .query_map(params![pattern, limit as i64], row_to_asset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(assets)
    }

    pub fn list_asset_ids(&self, media_type: Option<MediaType>) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM assets WHERE (?1 IS NULL OR media_type = ?1) ORDER BY id ASC",
        )?;
        let ids = stmt
            .query_map([media_type.map(|m| m.as_str())], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn count_assets(&self) -> Result<i64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn row_to_asset(row: &rusqlite::Row) -> rusqlite::Result<Asset> {
    let media_type: String = row.get(4)?;
    Ok(Asset {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        directory: row.get(3)?,
        media_type: media_type.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?,
        size_bytes: row.get(5)?,
        sha256_hash: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        perceptual_hash: row.get(9)?,
        thumbnail_path: row.get(10)?,
        caption: row.get(11)?,
        caption_model: row.get(12)?,
        created_at: parse_timestamp(row.get(13)?),
        updated_at: parse_timestamp(row.get(14)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_asset(path: &str, hash: &str) -> NewAsset {
        NewAsset {
            path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or(path).to_string(),
            directory: "/photos".to_string(),
            media_type: MediaType::Image,
            size_bytes: 1024,
            sha256_hash: Some(hash.to_string()),
        }
    }

    #[test]
    fn test_upsert_detects_changes() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        let first = db.upsert_asset(&new_asset("/photos/a.jpg", "aaa")).unwrap();
        assert!(matches!(first, UpsertOutcome::Inserted(_)));

        db.set_caption(first.id(), "a beach", "placeholder").unwrap();
        let again = db.upsert_asset(&new_asset("/photos/a.jpg", "aaa")).unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged(first.id()));

        let changed = db.upsert_asset(&new_asset("/photos/a.jpg", "bbb")).unwrap();
        assert_eq!(changed, UpsertOutcome::Updated(first.id()));
        let asset = db.get_asset(first.id()).unwrap().unwrap();
        assert!(asset.caption.is_none());
        assert_eq!(asset.sha256_hash.as_deref(), Some("bbb"));
    }

    #[test]
    fn test_search_matches_caption_and_filename() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        let a = db.upsert_asset(&new_asset("/photos/dog.jpg", "1")).unwrap().id();
        let b = db.upsert_asset(&new_asset("/photos/img_002.jpg", "2")).unwrap().id();
        db.set_caption(b, "A Dog on a sofa", "placeholder").unwrap();
        db.upsert_asset(&new_asset("/photos/cat.jpg", "3")).unwrap();

        let hits: Vec<i64> = db.search_assets("dog", 10).unwrap().iter().map(|a| a.id).collect();
        assert_eq!(hits, vec![a, b]);
        assert_eq!(db.count_assets().unwrap(), 3);
    }
}
