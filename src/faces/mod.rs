pub mod clustering;

use image::{DynamicImage, GenericImageView};

use crate::db::BoundingBox;

pub use clustering::{
    cluster_unassigned, recluster_all, ClusterOutcome, JobControl, Unsupervised,
};

/// Crop a face region with 20% padding, clamped to the image bounds.
///
/// Returns `None` when the box lies entirely outside the image.
pub fn crop_face(img: &DynamicImage, bbox: &BoundingBox) -> Option<DynamicImage> {
    let (img_width, img_height) = img.dimensions();
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = (bbox.x - padding_x).max(0) as u32;
    let y = (bbox.y - padding_y).max(0) as u32;
    if x >= img_width || y >= img_height {
        return None;
    }

    let w = ((bbox.width + padding_x * 2).max(1) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2).max(1) as u32).min(img_height - y);

    Some(img.crop_imm(x, y, w.max(1), h.max(1)))
}
