use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Hex SHA-256 of a file's contents.
pub fn calculate_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// 16x16 gradient hash of a 64px thumbnail, base64 encoded.
pub fn calculate_perceptual_hash(path: &Path) -> Result<String> {
    use img_hash::HasherConfig;

    let img = image::open(path)?;
    let thumbnail = img.thumbnail(64, 64);

    let hasher = HasherConfig::new().hash_size(16, 16).to_hasher();

    // img_hash pins its own `image` version; hand it raw pixels.
    let rgba = thumbnail.to_rgba8();
    let (width, height) = rgba.dimensions();
    let hash_input = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
        .ok_or_else(|| anyhow!("Failed to create image for hashing"))?;

    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(hash_input));
    Ok(hash.to_base64())
}

pub fn hamming_distance(hash1: &str, hash2: &str) -> Result<u32> {
    use img_hash::ImageHash;

    let h1 = ImageHash::<Box<[u8]>>::from_base64(hash1)
        .map_err(|e| anyhow!("Invalid hash1: {:?}", e))?;
    let h2 = ImageHash::<Box<[u8]>>::from_base64(hash2)
        .map_err(|e| anyhow!("Invalid hash2: {:?}", e))?;

    Ok(h1.dist(&h2))
}
