//! Exact index over a contiguous `ndarray` matrix.
//!
//! On disk the index is two files: the blob at `path` (header plus row-major
//! little-endian f32 rows) and a JSON sidecar at `path.json` holding
//! `{ids, dim}`. The blob is written first and each file is replaced by an
//! atomic rename, so a crash between the two leaves a sidecar that no longer
//! matches and `load` rejects the pair instead of serving wrong ids.

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::{check_batch, normalized, rank, IndexError, SearchHit, VectorIndex};

const MAGIC: &[u8; 4] = b"DRFX";
const VERSION: u32 = 1;
/// Magic, version, row count, dimension.
const HEADER_LEN: u64 = 4 + 4 + 8 + 8;

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    ids: Vec<i64>,
    dim: usize,
}

/// Normalized rows in insertion order, with an id to row mapping.
#[derive(Debug, Default)]
pub struct FlatIndex {
    matrix: Option<Array2<f32>>,
    ids: Vec<i64>,
    positions: HashMap<i64, usize>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }

    pub fn exists(path: &Path) -> bool {
        path.exists() && Self::sidecar_path(path).exists()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let sidecar_path = Self::sidecar_path(path);
        let sidecar: Sidecar = serde_json::from_str(
            &std::fs::read_to_string(&sidecar_path)
                .with_context(|| format!("Failed to read index sidecar {}", sidecar_path.display()))?,
        )
        .with_context(|| format!("Failed to parse index sidecar {}", sidecar_path.display()))?;

        let file = File::open(path)
            .with_context(|| format!("Failed to open index blob {}", path.display()))?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(IndexError::Corrupt(format!("{} is not an index blob", path.display())).into());
        }
        let version = read_u32(&mut reader)?;
        if version != VERSION {
            return Err(IndexError::Corrupt(format!("unsupported blob version {}", version)).into());
        }
        let rows = read_u64(&mut reader)?;
        let dim = read_u64(&mut reader)?;

        if sidecar.ids.len() as u64 != rows {
            return Err(IndexError::Corrupt(format!(
                "sidecar lists {} ids, blob holds {} rows",
                sidecar.ids.len(),
                rows
            ))
            .into());
        }
        if rows > 0 && sidecar.dim as u64 != dim {
            return Err(IndexError::Corrupt(format!(
                "sidecar dim {} differs from blob dim {}",
                sidecar.dim, dim
            ))
            .into());
        }
        let expected_len = rows
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_LEN));
        if expected_len != Some(file_len) {
            return Err(IndexError::Corrupt(format!(
                "blob is {} bytes, header declares {} rows of dim {}",
                file_len, rows, dim
            ))
            .into());
        }
        let rows = rows as usize;
        let dim = dim as usize;

        let mut data = vec![0f32; rows * dim];
        let mut buf = [0u8; 4];
        for value in data.iter_mut() {
            reader.read_exact(&mut buf)?;
            *value = f32::from_le_bytes(buf);
        }

        let mut positions = HashMap::with_capacity(rows);
        for (pos, &id) in sidecar.ids.iter().enumerate() {
            if positions.insert(id, pos).is_some() {
                return Err(IndexError::Corrupt(format!("duplicate id {}", id)).into());
            }
        }

        let matrix = if rows == 0 {
            None
        } else {
            Some(Array2::from_shape_vec((rows, dim), data)?)
        };

        Ok(Self {
            matrix,
            ids: sidecar.ids,
            positions,
        })
    }

    fn write_blob(&self, path: &Path) -> Result<()> {
        let (rows, dim) = self.matrix.as_ref().map(|m| m.dim()).unwrap_or((0, 0));
        let tmp = tmp_path(path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(MAGIC)?;
            writer.write_all(&VERSION.to_le_bytes())?;
            writer.write_all(&(rows as u64).to_le_bytes())?;
            writer.write_all(&(dim as u64).to_le_bytes())?;
            if let Some(matrix) = &self.matrix {
                for value in matrix.iter() {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn write_sidecar(&self, path: &Path) -> Result<()> {
        let sidecar = Sidecar {
            ids: self.ids.clone(),
            dim: self.dim().unwrap_or(0),
        };
        let sidecar_path = Self::sidecar_path(path);
        let tmp = tmp_path(&sidecar_path);
        std::fs::write(&tmp, serde_json::to_vec(&sidecar)?)?;
        std::fs::rename(&tmp, &sidecar_path)?;
        Ok(())
    }
}

impl VectorIndex for FlatIndex {
    fn add(&mut self, ids: &[i64], vectors: &[Vec<f32>]) -> Result<()> {
        let dim = match check_batch(self.dim(), ids, vectors)? {
            Some(dim) => dim,
            None => return Ok(()),
        };
        let matrix = self
            .matrix
            .get_or_insert_with(|| Array2::zeros((0, dim)));

        for (&id, vector) in ids.iter().zip(vectors) {
            let unit = normalized(vector);
            match self.positions.get(&id) {
                Some(&pos) => matrix.row_mut(pos).assign(&ArrayView1::from(&unit[..])),
                None => {
                    matrix.push_row(ArrayView1::from(&unit[..]))?;
                    self.positions.insert(id, self.ids.len());
                    self.ids.push(id);
                }
            }
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let Some(matrix) = &self.matrix else {
            return Ok(Vec::new());
        };
        let dim = matrix.len_of(Axis(1));
        if query.len() != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                got: query.len(),
            }
            .into());
        }

        let query = Array1::from(normalized(query));
        let scores = matrix.dot(&query);
        let hits = self
            .ids
            .iter()
            .zip(scores.iter())
            .map(|(&id, &score)| SearchHit { id, score })
            .collect();

        Ok(rank(hits, k))
    }

    fn clear(&mut self) {
        self.matrix = None;
        self.ids.clear();
        self.positions.clear();
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn dim(&self) -> Option<usize> {
        self.matrix.as_ref().map(|m| m.len_of(Axis(1)))
    }

    /// Blob first, then sidecar.
    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.write_blob(path)
            .with_context(|| format!("Failed to write index blob {}", path.display()))?;
        self.write_sidecar(path)
            .with_context(|| format!("Failed to write index sidecar for {}", path.display()))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
