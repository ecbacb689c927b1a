pub mod discovery;
pub mod hashing;
pub mod thumbnails;

pub use discovery::{classify_path, discover_media};
pub use hashing::{calculate_perceptual_hash, calculate_sha256, hamming_distance};
pub use thumbnails::ThumbnailManager;
