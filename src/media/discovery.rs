use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::db::MediaType;

/// Media type of a path by extension, or `None` for files we don't ingest.
pub fn classify_path(path: &Path, config: &IngestConfig) -> Option<MediaType> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    if config.image_extensions.iter().any(|e| e.to_lowercase() == ext) {
        Some(MediaType::Image)
    } else if config.video_extensions.iter().any(|e| e.to_lowercase() == ext) {
        Some(MediaType::Video)
    } else {
        None
    }
}

/// Every media file below `directory`, sorted by path.
pub fn discover_media(directory: &Path, config: &IngestConfig) -> Result<Vec<PathBuf>> {
    let mut media = Vec::new();

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.is_file() && classify_path(path, config).is_some() {
            media.push(path.to_path_buf());
        }
    }

    media.sort();
    Ok(media)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_discover_media() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.JPG")).unwrap();
        File::create(dir.path().join("clip.mp4")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let config = IngestConfig::default();
        let media = discover_media(dir.path(), &config).unwrap();

        assert_eq!(media.len(), 3);
        assert_eq!(classify_path(&media[0], &config), Some(MediaType::Video));
        assert_eq!(
            classify_path(&dir.path().join("photo1.JPG"), &config),
            Some(MediaType::Image)
        );
    }
}
