//! In-memory vector similarity index.
//!
//! Two interchangeable backends: [`BruteForceIndex`], a linear scan over stored
//! vectors, and [`FlatIndex`], a contiguous `ndarray` matrix of normalized rows
//! that can be saved to and loaded from disk. Neither supports removing single
//! ids; a rebuild from the stored embeddings is the only way to drop entries.
//!
//! Results are ranked by cosine similarity, descending. Equal scores are
//! broken by lower id first.

pub mod brute;
pub mod flat;

use anyhow::Result;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::config::{IndexBackend, IndexConfig};

pub use brute::BruteForceIndex;
pub use flat::FlatIndex;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector has dimension {got}, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("{ids} ids for {vectors} vectors")]
    LengthMismatch { ids: usize, vectors: usize },

    #[error("index files are inconsistent: {0}")]
    Corrupt(String),
}

/// A ranked search result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: i64,
    pub score: f32,
}

pub trait VectorIndex: Send {
    /// Insert vectors; an id that is already present is overwritten in place.
    fn add(&mut self, ids: &[i64], vectors: &[Vec<f32>]) -> Result<()>;

    /// Top-k ids by cosine similarity to `query`.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimension fixed by the first insert, `None` while empty.
    fn dim(&self) -> Option<usize>;

    /// Persist to disk. Backends without persistence do nothing.
    fn save(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn normalized(vector: &[f32]) -> Vec<f32> {
    let mut out = vector.to_vec();
    normalize(&mut out);
    out
}

/// Check a batch against the index dimension (if any) and against itself.
pub(crate) fn check_batch(
    current_dim: Option<usize>,
    ids: &[i64],
    vectors: &[Vec<f32>],
) -> Result<Option<usize>, IndexError> {
    if ids.len() != vectors.len() {
        return Err(IndexError::LengthMismatch {
            ids: ids.len(),
            vectors: vectors.len(),
        });
    }

    let mut dim = current_dim;
    for vector in vectors {
        match dim {
            Some(expected) if expected != vector.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
            Some(_) => {}
            None => dim = Some(vector.len()),
        }
    }
    Ok(dim)
}

/// Keep the `k` best hits: score descending, then id ascending. NaN scores
/// rank last.
pub(crate) fn rank(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    fn key(hit: &SearchHit) -> f32 {
        if hit.score.is_nan() {
            f32::NEG_INFINITY
        } else {
            hit.score
        }
    }
    hits.sort_by(|a, b| key(b).total_cmp(&key(a)).then(a.id.cmp(&b.id)));
    hits.truncate(k);
    hits
}

/// The single process-wide index instance. Every operation takes the same lock.
#[derive(Clone)]
pub struct SharedIndex {
    inner: Arc<Mutex<Box<dyn VectorIndex>>>,
}

impl SharedIndex {
    pub fn new(index: Box<dyn VectorIndex>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(index)),
        }
    }

    /// Build the configured backend, loading the flat index from disk when present.
    pub fn from_config(config: &IndexConfig) -> Result<Self> {
        let index: Box<dyn VectorIndex> = match config.backend {
            IndexBackend::Brute => Box::new(BruteForceIndex::new()),
            IndexBackend::Flat => {
                if FlatIndex::exists(&config.path) {
                    let loaded = FlatIndex::load(&config.path)?;
                    tracing::info!(
                        path = %config.path.display(),
                        entries = loaded.len(),
                        "Loaded vector index"
                    );
                    Box::new(loaded)
                } else {
                    Box::new(FlatIndex::new())
                }
            }
        };
        Ok(Self::new(index))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn VectorIndex>>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("vector index mutex poisoned"))
    }

    pub fn add(&self, ids: &[i64], vectors: &[Vec<f32>]) -> Result<()> {
        self.lock()?.add(ids, vectors)
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.lock()?.search(query, k)
    }

    pub fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    pub fn dim(&self) -> Result<Option<usize>> {
        Ok(self.lock()?.dim())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.lock()?.save(path)
    }

    /// Clear and refill under one lock so searches never see a half-built index.
    pub fn rebuild(&self, ids: &[i64], vectors: &[Vec<f32>]) -> Result<()> {
        let mut index = self.lock()?;
        index.clear();
        index.add(ids, vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_rank_breaks_ties_by_id() {
        let hits = vec![
            SearchHit { id: 9, score: 0.5 },
            SearchHit { id: 2, score: 0.9 },
            SearchHit { id: 4, score: 0.5 },
            SearchHit { id: 1, score: 0.1 },
        ];
        let ranked: Vec<i64> = rank(hits, 3).iter().map(|h| h.id).collect();
        assert_eq!(ranked, vec![2, 4, 9]);
    }

    #[test]
    fn test_rank_puts_nan_scores_last() {
        let hits = vec![
            SearchHit { id: 3, score: f32::NAN },
            SearchHit { id: 7, score: 0.2 },
            SearchHit { id: 1, score: f32::NAN },
            SearchHit { id: 5, score: 0.8 },
            SearchHit { id: 2, score: -0.4 },
        ];
        let ranked: Vec<i64> = rank(hits, 5).iter().map(|h| h.id).collect();
        assert_eq!(ranked, vec![5, 7, 2, 1, 3]);
    }

    #[test]
    fn test_check_batch() {
        assert_eq!(check_batch(None, &[1, 2], &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap(), Some(2));
        assert!(matches!(
            check_batch(Some(3), &[1], &[vec![1.0, 0.0]]),
            Err(IndexError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(
            check_batch(None, &[1, 2], &[vec![1.0]]),
            Err(IndexError::LengthMismatch { .. })
        ));
        assert!(check_batch(None, &[1, 2], &[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_shared_index_rebuild() {
        let shared = SharedIndex::new(Box::new(BruteForceIndex::new()));
        shared.add(&[1, 2], &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert_eq!(shared.len().unwrap(), 2);

        shared.rebuild(&[7], &[vec![0.0, 0.0, 1.0]]).unwrap();
        assert_eq!(shared.len().unwrap(), 1);
        assert_eq!(shared.dim().unwrap(), Some(3));
        let hits = shared.search(&[0.0, 0.0, 2.0], 5).unwrap();
        assert_eq!(hits[0].id, 7);
    }
}
