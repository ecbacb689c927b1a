use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ThumbnailConfig;

/// Generates and caches JPEG thumbnails keyed by content hash
pub struct ThumbnailManager {
    cache_dir: PathBuf,
    size: u32,
}

impl ThumbnailManager {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            cache_dir: config.path.clone(),
            size: config.size,
        }
    }

    /// Cache file for an asset. Identical content shares one thumbnail; the
    /// path is hashed instead when no content hash is known.
    pub fn cache_path(&self, original: &Path, sha256: Option<&str>) -> PathBuf {
        let key = match sha256 {
            Some(hash) if hash.len() >= 32 => hash[..32].to_string(),
            _ => {
                let digest = Sha256::digest(original.to_string_lossy().as_bytes());
                format!("p{:x}", digest)[..33].to_string()
            }
        };
        self.cache_dir.join(format!("{}_{}.jpg", key, self.size))
    }

    /// Generate the thumbnail unless it already exists. Returns its path.
    ///
    /// The image is written to a temporary name and renamed into place, so an
    /// existing cache file is always complete.
    pub fn generate(&self, original: &Path, sha256: Option<&str>) -> Result<PathBuf> {
        let cache_path = self.cache_path(original, sha256);
        if cache_path.exists() {
            return Ok(cache_path);
        }

        fs::create_dir_all(&self.cache_dir)?;

        let img = image::open(original)
            .with_context(|| format!("Failed to open image {}", original.display()))?;
        let thumbnail = img.thumbnail(self.size, self.size).to_rgb8();

        let tmp = cache_path.with_extension("jpg.tmp");
        thumbnail
            .save_with_format(&tmp, image::ImageFormat::Jpeg)
            .with_context(|| format!("Failed to write thumbnail {}", tmp.display()))?;
        fs::rename(&tmp, &cache_path)?;

        Ok(cache_path)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
