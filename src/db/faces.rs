//! Face detections and person clusters.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{bytes_to_vector, now, vector_to_bytes, Database};

/// Bounding box for a detected face, in source image pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A face as returned by a detector, before it has a row
#[derive(Debug, Clone, Copy)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: Option<f32>,
}

/// A detected face in an asset
#[derive(Debug, Clone)]
pub struct Face {
    pub id: i64,
    pub asset_id: i64,
    pub bbox: BoundingBox,
    pub confidence: Option<f32>,
    pub embedding: Option<Vec<f32>>,
    pub person_id: Option<i64>,
}

/// A person cluster
#[derive(Debug, Clone)]
pub struct Person {
    pub id: i64,
    pub name: Option<String>,
    /// Unit-normalized running mean of member embeddings; `None` while empty.
    pub centroid: Option<Vec<f32>>,
    pub face_count: i64,
}

impl Person {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Person {}", self.id))
    }
}

impl Database {
    /// Replace every face of an asset with a fresh detection result.
    ///
    /// Persons that lose faces get their counts recomputed; their centroids are
    /// left as-is until the next full recluster.
    pub fn replace_faces(&self, asset_id: i64, faces: &[DetectedFace]) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let affected: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT person_id FROM faces WHERE asset_id = ? AND person_id IS NOT NULL",
            )?;
            let ids = stmt
                .query_map([asset_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        };

        tx.execute("DELETE FROM faces WHERE asset_id = ?", [asset_id])?;

        for person_id in &affected {
            tx.execute(
                r#"
                UPDATE persons
                SET face_count = (SELECT COUNT(*) FROM faces WHERE person_id = ?1), updated_at = ?2
                WHERE id = ?1
                "#,
                params![person_id, now()],
            )?;
        }

        let created = now();
        let mut ids = Vec::with_capacity(faces.len());
        for face in faces {
            tx.execute(
                r#"
                INSERT INTO faces (asset_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    asset_id,
                    face.bbox.x,
                    face.bbox.y,
                    face.bbox.width,
                    face.bbox.height,
                    face.confidence,
                    created
                ],
            )?;
            ids.push(tx.last_insert_rowid());
        }

        tx.commit()?;
        Ok(ids)
    }

    pub fn get_face(&self, face_id: i64) -> Result<Option<Face>> {
        let face = self
            .conn()?
            .query_row(
                r#"
                SELECT id, asset_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, embedding, person_id
                FROM faces WHERE id = ?
                "#,
                [face_id],
                row_to_face,
            )
            .optional()?;
        Ok(face)
    }

    pub fn faces_for_asset(&self, asset_id: i64) -> Result<Vec<Face>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, asset_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, embedding, person_id
            FROM faces WHERE asset_id = ? ORDER BY id ASC
            "#,
        )?;
        let faces = stmt
            .query_map([asset_id], row_to_face)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    pub fn set_face_embedding(&self, face_id: i64, embedding: &[f32]) -> Result<()> {
        self.conn()?.execute(
            "UPDATE faces SET embedding = ?, embedding_dim = ? WHERE id = ?",
            params![vector_to_bytes(embedding), embedding.len() as i64, face_id],
        )?;
        Ok(())
    }

    /// Embedded faces not yet attached to a person.
    pub fn count_unassigned_embedded_faces(&self) -> Result<i64> {
        let count = self.conn()?.query_row(
            "SELECT COUNT(*) FROM faces WHERE embedding IS NOT NULL AND person_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// (face id, embedding) of unassigned embedded faces in id order.
    pub fn unassigned_face_embeddings(&self, limit: usize) -> Result<Vec<(i64, Vec<f32>)>> {
        self.face_embeddings_where("person_id IS NULL", limit)
    }

    /// (face id, embedding) of every embedded face in id order.
    pub fn all_face_embeddings(&self, limit: usize) -> Result<Vec<(i64, Vec<f32>)>> {
        self.face_embeddings_where("1 = 1", limit)
    }

    fn face_embeddings_where(&self, predicate: &str, limit: usize) -> Result<Vec<(i64, Vec<f32>)>> {
        let sql = format!(
            "SELECT id, embedding FROM faces WHERE embedding IS NOT NULL AND {} ORDER BY id ASC LIMIT ?",
            predicate
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get(0)?, bytes_to_vector(&bytes)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Persons ordered by id.
    pub fn list_persons(&self) -> Result<Vec<Person>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, centroid, face_count FROM persons ORDER BY id ASC")?;
        let persons = stmt
            .query_map([], |row| {
                let centroid: Option<Vec<u8>> = row.get(2)?;
                Ok(Person {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    centroid: centroid.map(|bytes| bytes_to_vector(&bytes)),
                    face_count: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(persons)
    }

    pub fn count_persons(&self) -> Result<i64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM persons", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Attach an unassigned face to a person and store the person's new
    /// centroid, atomically. Returns `false` and changes nothing when the face
    /// is gone or already belongs to someone.
    pub fn assign_face(&self, face_id: i64, person_id: i64, centroid: &[f32]) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let claimed = tx.execute(
            "UPDATE faces SET person_id = ? WHERE id = ? AND person_id IS NULL",
            params![person_id, face_id],
        )?;
        if claimed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE persons SET centroid = ?, face_count = face_count + 1, updated_at = ? WHERE id = ?",
            params![vector_to_bytes(centroid), now(), person_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Create a person seeded with one unassigned face, atomically. `None`
    /// when the face is gone or already assigned.
    pub fn create_person_with_face(&self, face_id: i64, centroid: &[f32]) -> Result<Option<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ts = now();
        tx.execute(
            "INSERT INTO persons (centroid, face_count, created_at, updated_at) VALUES (?, 1, ?, ?)",
            params![vector_to_bytes(centroid), ts, ts],
        )?;
        let person_id = tx.last_insert_rowid();
        let claimed = tx.execute(
            "UPDATE faces SET person_id = ? WHERE id = ? AND person_id IS NULL",
            params![person_id, face_id],
        )?;
        if claimed == 0 {
            return Ok(None);
        }
        tx.commit()?;
        Ok(Some(person_id))
    }

    /// Detach every face and empty every person, keeping person rows and names.
    pub fn reset_clusters(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE faces SET person_id = NULL WHERE person_id IS NOT NULL", [])?;
        tx.execute(
            "UPDATE persons SET centroid = NULL, face_count = 0, updated_at = ?",
            [now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn rename_person(&self, person_id: i64, name: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE persons SET name = ?, updated_at = ? WHERE id = ?",
            params![name, now(), person_id],
        )?;
        Ok(())
    }
}

fn row_to_face(row: &rusqlite::Row) -> rusqlite::Result<Face> {
    let embedding: Option<Vec<u8>> = row.get(7)?;
    Ok(Face {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        },
        confidence: row.get(6)?,
        embedding: embedding.map(|bytes| bytes_to_vector(&bytes)),
        person_id: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MediaType, NewAsset};

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let asset_id = db
            .upsert_asset(&NewAsset {
                path: "/p/group.jpg".into(),
                filename: "group.jpg".into(),
                directory: "/p".into(),
                media_type: MediaType::Image,
                size_bytes: 10,
                sha256_hash: Some("h".into()),
            })
            .unwrap()
            .id();
        (db, asset_id)
    }

    fn detected(x: i32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x, y: 0, width: 10, height: 10 },
            confidence: Some(0.9),
        }
    }

    #[test]
    fn test_replace_faces_recounts_persons() {
        let (db, asset_id) = setup();
        let ids = db.replace_faces(asset_id, &[detected(0), detected(20)]).unwrap();
        assert_eq!(ids.len(), 2);

        db.set_face_embedding(ids[0], &[1.0, 0.0]).unwrap();
        let person = db.create_person_with_face(ids[0], &[1.0, 0.0]).unwrap().unwrap();

        let replaced = db.replace_faces(asset_id, &[detected(5)]).unwrap();
        assert_eq!(db.faces_for_asset(asset_id).unwrap().len(), 1);
        assert!(db.get_face(ids[0]).unwrap().is_none());
        assert!(db.get_face(replaced[0]).unwrap().unwrap().person_id.is_none());

        let persons = db.list_persons().unwrap();
        assert_eq!(persons[0].id, person);
        assert_eq!(persons[0].face_count, 0);
    }

    #[test]
    fn test_unassigned_requires_embedding() {
        let (db, asset_id) = setup();
        let ids = db
            .replace_faces(asset_id, &[detected(0), detected(1), detected(2)])
            .unwrap();
        db.set_face_embedding(ids[0], &[1.0, 0.0]).unwrap();
        db.set_face_embedding(ids[2], &[0.0, 1.0]).unwrap();

        assert_eq!(db.count_unassigned_embedded_faces().unwrap(), 2);
        db.create_person_with_face(ids[0], &[1.0, 0.0]).unwrap();
        assert_eq!(db.count_unassigned_embedded_faces().unwrap(), 1);

        let pending = db.unassigned_face_embeddings(10).unwrap();
        assert_eq!(pending, vec![(ids[2], vec![0.0, 1.0])]);
        assert_eq!(db.all_face_embeddings(10).unwrap().len(), 2);
    }

    #[test]
    fn test_reset_keeps_person_rows() {
        let (db, asset_id) = setup();
        let ids = db.replace_faces(asset_id, &[detected(0)]).unwrap();
        db.set_face_embedding(ids[0], &[1.0, 0.0]).unwrap();
        let person = db.create_person_with_face(ids[0], &[1.0, 0.0]).unwrap().unwrap();
        db.rename_person(person, "Ada").unwrap();

        db.reset_clusters().unwrap();

        let persons = db.list_persons().unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].display_name(), "Ada");
        assert_eq!(persons[0].face_count, 0);
        assert!(persons[0].centroid.is_none());
        assert_eq!(db.count_unassigned_embedded_faces().unwrap(), 1);
    }

    #[test]
    fn test_assigned_face_is_not_claimed_twice() {
        let (db, asset_id) = setup();
        let ids = db.replace_faces(asset_id, &[detected(0), detected(20)]).unwrap();
        db.set_face_embedding(ids[0], &[1.0, 0.0]).unwrap();
        db.set_face_embedding(ids[1], &[1.0, 0.0]).unwrap();

        let first = db.create_person_with_face(ids[0], &[1.0, 0.0]).unwrap().unwrap();
        assert!(db.assign_face(ids[1], first, &[1.0, 0.0]).unwrap());

        // A second pass working from a stale snapshot must not recount either face.
        assert!(!db.assign_face(ids[1], first, &[0.0, 1.0]).unwrap());
        assert_eq!(db.create_person_with_face(ids[0], &[0.0, 1.0]).unwrap(), None);

        let persons = db.list_persons().unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].face_count, 2);
        assert_eq!(persons[0].centroid.as_deref(), Some(&[1.0, 0.0][..]));

        // Missing faces are skipped the same way.
        assert!(!db.assign_face(9999, first, &[1.0, 0.0]).unwrap());
        assert_eq!(db.create_person_with_face(9999, &[1.0, 0.0]).unwrap(), None);
        assert_eq!(db.count_persons().unwrap(), 1);
    }
}
