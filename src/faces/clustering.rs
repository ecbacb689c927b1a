//! Sequential nearest-centroid face clustering.
//!
//! Faces are visited in id order. Each one joins the person whose centroid is
//! closest in cosine distance when that distance is within the threshold, and
//! otherwise seeds a new person. The result depends on visiting order; it is
//! an online approximation, not a batch clustering.
//!
//! Passes sharing a [`Database`] handle run one at a time. A face is only
//! placed if it is still unassigned when its transaction runs, so a pass
//! working from an outdated snapshot skips it instead of counting it twice.

use anyhow::Result;
use std::collections::VecDeque;

use crate::config::ClusteringConfig;
use crate::db::Database;
use crate::index::normalized;

/// Cooperative control hooks for long clustering runs.
pub trait JobControl {
    fn cancel_requested(&self) -> Result<bool>;

    /// Record progress; called every `progress_every` faces and once at the end.
    fn checkpoint(&self, current: usize, total: usize) -> Result<()>;
}

/// Control for runs outside the task engine: never canceled, progress ignored.
pub struct Unsupervised;

impl JobControl for Unsupervised {
    fn cancel_requested(&self) -> Result<bool> {
        Ok(false)
    }

    fn checkpoint(&self, _current: usize, _total: usize) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterOutcome {
    /// Faces visited, including skipped ones.
    pub processed: usize,
    pub total: usize,
    /// Faces that joined an existing person.
    pub assigned: usize,
    /// Person rows inserted.
    pub persons_created: usize,
    /// Empty person rows reused for a new cluster.
    pub persons_reused: usize,
    /// Faces already assigned or deleted by the time they were placed.
    pub skipped: usize,
    pub canceled: bool,
}

/// `1 - dot(a, b)` for unit vectors; infinite when the dimensions differ.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>()
}

/// Index and distance of the closest centroid. The first of equal minima wins.
pub fn nearest_centroid<'a, I>(face: &[f32], centroids: I) -> Option<(usize, f32)>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut best: Option<(usize, f32)> = None;
    for (i, centroid) in centroids.into_iter().enumerate() {
        let distance = cosine_distance(face, centroid);
        match best {
            Some((_, d)) if distance >= d => {}
            _ => best = Some((i, distance)),
        }
    }
    best
}

/// Running mean `(centroid * count + face) / (count + 1)`, renormalized.
pub fn update_centroid(centroid: &[f32], count: i64, face: &[f32]) -> Vec<f32> {
    if count <= 0 || centroid.len() != face.len() {
        return normalized(face);
    }
    let n = count as f32;
    let mean: Vec<f32> = centroid
        .iter()
        .zip(face)
        .map(|(c, f)| (c * n + f) / (n + 1.0))
        .collect();
    normalized(&mean)
}

struct Cluster {
    person_id: i64,
    centroid: Vec<f32>,
    count: i64,
}

/// Working set of persons for one pass, mirrored to the store face by face.
struct Assigner<'a> {
    db: &'a Database,
    threshold: f32,
    clusters: Vec<Cluster>,
    /// Empty persons, reused in id order before new rows are inserted.
    spare: VecDeque<i64>,
}

impl<'a> Assigner<'a> {
    fn load(db: &'a Database, threshold: f32) -> Result<Self> {
        let mut clusters = Vec::new();
        let mut spare = VecDeque::new();
        for person in db.list_persons()? {
            match person.centroid {
                Some(centroid) if person.face_count > 0 => clusters.push(Cluster {
                    person_id: person.id,
                    centroid,
                    count: person.face_count,
                }),
                _ => spare.push_back(person.id),
            }
        }
        Ok(Self {
            db,
            threshold,
            clusters,
            spare,
        })
    }

    /// Place one face. Each placement is its own store transaction.
    fn place(&mut self, face_id: i64, embedding: &[f32], outcome: &mut ClusterOutcome) -> Result<()> {
        let face = normalized(embedding);

        let nearest = nearest_centroid(&face, self.clusters.iter().map(|c| c.centroid.as_slice()));
        if let Some((i, distance)) = nearest {
            if distance <= self.threshold {
                let cluster = &mut self.clusters[i];
                let centroid = update_centroid(&cluster.centroid, cluster.count, &face);
                if !self.db.assign_face(face_id, cluster.person_id, &centroid)? {
                    skip(face_id, outcome);
                    return Ok(());
                }
                cluster.centroid = centroid;
                cluster.count += 1;
                outcome.assigned += 1;
                return Ok(());
            }
        }

        let person_id = match self.spare.pop_front() {
            Some(person_id) => {
                if !self.db.assign_face(face_id, person_id, &face)? {
                    self.spare.push_front(person_id);
                    skip(face_id, outcome);
                    return Ok(());
                }
                outcome.persons_reused += 1;
                person_id
            }
            None => match self.db.create_person_with_face(face_id, &face)? {
                Some(person_id) => {
                    outcome.persons_created += 1;
                    person_id
                }
                None => {
                    skip(face_id, outcome);
                    return Ok(());
                }
            },
        };
        tracing::debug!(face_id, person_id, "Started new person");

        self.clusters.push(Cluster {
            person_id,
            centroid: face,
            count: 1,
        });
        Ok(())
    }
}

fn skip(face_id: i64, outcome: &mut ClusterOutcome) {
    tracing::debug!(face_id, "Face no longer unassigned, skipping");
    outcome.skipped += 1;
}

/// Incremental pass over embedded faces that have no person yet.
pub fn cluster_unassigned(db: &Database, config: &ClusteringConfig) -> Result<ClusterOutcome> {
    let _pass = db.clustering_lock();
    let faces = db.unassigned_face_embeddings(config.batch_limit)?;
    let mut assigner = Assigner::load(db, config.threshold)?;
    let mut outcome = ClusterOutcome {
        total: faces.len(),
        ..Default::default()
    };

    for (face_id, embedding) in &faces {
        assigner.place(*face_id, embedding, &mut outcome)?;
        outcome.processed += 1;
    }

    tracing::info!(
        faces = outcome.processed,
        assigned = outcome.assigned,
        created = outcome.persons_created,
        skipped = outcome.skipped,
        "Incremental clustering finished"
    );
    Ok(outcome)
}

/// Full recluster: detach every face, empty every person, then reassign up to
/// `batch_limit` faces in id order.
///
/// Cancellation is checked before each face. A canceled run keeps the
/// assignments made so far; the remaining faces stay unassigned.
pub fn recluster_all(
    db: &Database,
    config: &ClusteringConfig,
    control: &dyn JobControl,
) -> Result<ClusterOutcome> {
    let _pass = db.clustering_lock();
    let faces = db.all_face_embeddings(config.batch_limit)?;
    db.reset_clusters()?;

    let mut assigner = Assigner::load(db, config.threshold)?;
    let mut outcome = ClusterOutcome {
        total: faces.len(),
        ..Default::default()
    };
    let progress_every = config.progress_every.max(1);
    control.checkpoint(0, outcome.total)?;

    for (face_id, embedding) in &faces {
        if control.cancel_requested()? {
            outcome.canceled = true;
            break;
        }

        assigner.place(*face_id, embedding, &mut outcome)?;
        outcome.processed += 1;

        if outcome.processed % progress_every == 0 {
            control.checkpoint(outcome.processed, outcome.total)?;
        }
    }

    control.checkpoint(outcome.processed, outcome.total)?;

    tracing::info!(
        faces = outcome.processed,
        total = outcome.total,
        created = outcome.persons_created,
        reused = outcome.persons_reused,
        canceled = outcome.canceled,
        "Recluster finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BoundingBox, DetectedFace, MediaType, NewAsset};
    use std::cell::{Cell, RefCell};

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let asset_id = db
            .upsert_asset(&NewAsset {
                path: "/p/crowd.jpg".into(),
                filename: "crowd.jpg".into(),
                directory: "/p".into(),
                media_type: MediaType::Image,
                size_bytes: 10,
                sha256_hash: Some("h".into()),
            })
            .unwrap()
            .id();
        (db, asset_id)
    }

    fn add_faces(db: &Database, asset_id: i64, embeddings: &[Vec<f32>]) -> Vec<i64> {
        let detected: Vec<DetectedFace> = (0..embeddings.len())
            .map(|i| DetectedFace {
                bbox: BoundingBox { x: i as i32 * 10, y: 0, width: 8, height: 8 },
                confidence: None,
            })
            .collect();
        let ids = db.replace_faces(asset_id, &detected).unwrap();
        for (id, embedding) in ids.iter().zip(embeddings) {
            db.set_face_embedding(*id, embedding).unwrap();
        }
        ids
    }

    /// A and B are 0.1 apart; C is orthogonal enough to sit beyond 0.35 from both.
    fn scenario() -> Vec<Vec<f32>> {
        let y = (0.19f32).sqrt();
        let c_y = 0.01 / y;
        let c_z = (1.0 - 0.01 - c_y * c_y).sqrt();
        vec![vec![1.0, 0.0, 0.0], vec![0.9, y, 0.0], vec![0.1, c_y, c_z]]
    }

    fn person_of(db: &Database, face_id: i64) -> Option<i64> {
        db.get_face(face_id).unwrap().unwrap().person_id
    }

    #[test]
    fn test_nearest_centroid_prefers_first_minimum() {
        let a = [1.0, 0.0];
        let b = [1.0, 0.0];
        let c = [0.0, 1.0];
        let (i, d) = nearest_centroid(&[1.0, 0.0], [&a[..], &b[..], &c[..]]).unwrap();
        assert_eq!(i, 0);
        assert!(d.abs() < 1e-6);
        assert!(nearest_centroid(&[1.0, 0.0], std::iter::empty()).is_none());
    }

    #[test]
    fn test_update_centroid_is_unit_mean() {
        let c = update_centroid(&[1.0, 0.0], 1, &[0.0, 1.0]);
        let inv = 1.0 / 2f32.sqrt();
        assert!((c[0] - inv).abs() < 1e-6);
        assert!((c[1] - inv).abs() < 1e-6);
        assert_eq!(update_centroid(&[1.0, 0.0], 0, &[0.0, 3.0]), vec![0.0, 1.0]);
    }

    #[test]
    fn test_incremental_scenario_two_persons() {
        let (db, asset_id) = setup();
        let ids = add_faces(&db, asset_id, &scenario());

        let outcome = cluster_unassigned(&db, &ClusteringConfig::default()).unwrap();
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.persons_created, 2);
        assert_eq!(outcome.assigned, 1);

        let a = person_of(&db, ids[0]).unwrap();
        assert_eq!(person_of(&db, ids[1]), Some(a));
        let c = person_of(&db, ids[2]).unwrap();
        assert_ne!(a, c);

        let persons = db.list_persons().unwrap();
        assert_eq!(persons.len(), 2);
        assert_eq!(persons[0].face_count, 2);
        let centroid = persons[0].centroid.as_ref().unwrap();
        let norm: f32 = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        // A second pass finds nothing left to do.
        let again = cluster_unassigned(&db, &ClusteringConfig::default()).unwrap();
        assert_eq!(again.processed, 0);
    }

    #[test]
    fn test_recluster_is_deterministic_and_reuses_persons() {
        let (db, asset_id) = setup();
        let ids = add_faces(&db, asset_id, &scenario());
        cluster_unassigned(&db, &ClusteringConfig::default()).unwrap();
        let before: Vec<Option<i64>> = ids.iter().map(|id| person_of(&db, *id)).collect();

        let first = recluster_all(&db, &ClusteringConfig::default(), &Unsupervised).unwrap();
        assert_eq!(first.persons_created, 0);
        assert_eq!(first.persons_reused, 2);
        let after: Vec<Option<i64>> = ids.iter().map(|id| person_of(&db, *id)).collect();
        assert_eq!(before, after);

        recluster_all(&db, &ClusteringConfig::default(), &Unsupervised).unwrap();
        let again: Vec<Option<i64>> = ids.iter().map(|id| person_of(&db, *id)).collect();
        assert_eq!(after, again);
        assert_eq!(db.count_persons().unwrap(), 2);
    }

    struct CancelAfter {
        polls_left: Cell<usize>,
        checkpoints: RefCell<Vec<(usize, usize)>>,
    }

    impl JobControl for CancelAfter {
        fn cancel_requested(&self) -> Result<bool> {
            let left = self.polls_left.get();
            if left == 0 {
                return Ok(true);
            }
            self.polls_left.set(left - 1);
            Ok(false)
        }

        fn checkpoint(&self, current: usize, total: usize) -> Result<()> {
            self.checkpoints.borrow_mut().push((current, total));
            Ok(())
        }
    }

    #[test]
    fn test_recluster_cancel_keeps_partial_results() {
        let (db, asset_id) = setup();
        let embeddings: Vec<Vec<f32>> = (0..6)
            .map(|i| {
                let mut v = vec![0.0; 6];
                v[i] = 1.0;
                v
            })
            .collect();
        let ids = add_faces(&db, asset_id, &embeddings);

        let config = ClusteringConfig {
            progress_every: 2,
            ..Default::default()
        };
        let control = CancelAfter {
            polls_left: Cell::new(3),
            checkpoints: RefCell::new(Vec::new()),
        };
        let outcome = recluster_all(&db, &config, &control).unwrap();

        assert!(outcome.canceled);
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.total, 6);
        assert!(person_of(&db, ids[2]).is_some());
        assert!(person_of(&db, ids[3]).is_none());
        assert_eq!(db.count_unassigned_embedded_faces().unwrap(), 3);
        assert_eq!(*control.checkpoints.borrow(), vec![(0, 6), (2, 6), (3, 6)]);
    }

    #[test]
    fn test_batch_limit_caps_work() {
        let (db, asset_id) = setup();
        add_faces(&db, asset_id, &scenario());
        let config = ClusteringConfig {
            batch_limit: 2,
            ..Default::default()
        };
        let outcome = cluster_unassigned(&db, &config).unwrap();
        assert_eq!(outcome.total, 2);
        assert_eq!(db.count_unassigned_embedded_faces().unwrap(), 1);
    }

    #[test]
    fn test_outdated_snapshot_skips_claimed_faces() {
        let (db, asset_id) = setup();
        let ids = add_faces(&db, asset_id, &scenario());
        let mut assigner = Assigner::load(&db, 0.35).unwrap();

        // Another pass claims the first face after this one took its snapshot.
        let other = db
            .create_person_with_face(ids[0], &scenario()[0])
            .unwrap()
            .unwrap();

        let mut outcome = ClusterOutcome::default();
        for (face_id, embedding) in ids.iter().zip(scenario()) {
            assigner.place(*face_id, &embedding, &mut outcome).unwrap();
        }
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.persons_created, 2);
        assert_eq!(outcome.assigned, 0);

        let persons = db.list_persons().unwrap();
        assert_eq!(persons.len(), 3);
        assert_eq!(persons.iter().map(|p| p.face_count).sum::<i64>(), 3);
        assert_eq!(person_of(&db, ids[0]), Some(other));
    }
}
