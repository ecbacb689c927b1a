use anyhow::Result;
use rayon::prelude::*;
use std::collections::HashMap;

use super::{check_batch, normalized, rank, IndexError, SearchHit, VectorIndex};

/// Linear scan over normalized vectors. O(n) per query, parallelised with rayon.
#[derive(Debug, Default)]
pub struct BruteForceIndex {
    ids: Vec<i64>,
    vectors: Vec<Vec<f32>>,
    positions: HashMap<i64, usize>,
    dim: Option<usize>,
}

impl BruteForceIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorIndex for BruteForceIndex {
    fn add(&mut self, ids: &[i64], vectors: &[Vec<f32>]) -> Result<()> {
        self.dim = check_batch(self.dim, ids, vectors)?;

        for (&id, vector) in ids.iter().zip(vectors) {
            let unit = normalized(vector);
            match self.positions.get(&id) {
                Some(&pos) => self.vectors[pos] = unit,
                None => {
                    self.positions.insert(id, self.ids.len());
                    self.ids.push(id);
                    self.vectors.push(unit);
                }
            }
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let Some(dim) = self.dim else {
            return Ok(Vec::new());
        };
        if query.len() != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                got: query.len(),
            }
            .into());
        }

        let query = normalized(query);
        let hits: Vec<SearchHit> = self
            .ids
            .par_iter()
            .zip(self.vectors.par_iter())
            .map(|(&id, vector)| SearchHit {
                id,
                score: vector.iter().zip(&query).map(|(a, b)| a * b).sum(),
            })
            .collect();

        Ok(rank(hits, k))
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.vectors.clear();
        self.positions.clear();
        self.dim = None;
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn dim(&self) -> Option<usize> {
        self.dim
    }
}
