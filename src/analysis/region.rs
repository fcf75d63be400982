use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, ImageFormat};

use super::error::{AnalysisError, AnalysisResult};
use super::types::BoundingBox;

/// Pixel rectangle guaranteed to lie inside the image and have non-zero area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Intersect `bbox` with a `width` x `height` image.
///
/// The intersection is taken in real coordinates and then widened to whole
/// pixels. Returns `None` when nothing of the box is left.
pub fn clamp_box(bbox: &BoundingBox, width: u32, height: u32) -> Option<PixelRect> {
    let BoundingBox { x, y, width: w, height: h } = *bbox;
    if ![x, y, w, h].iter().all(|v| v.is_finite()) {
        return None;
    }

    let (img_w, img_h) = (f64::from(width), f64::from(height));
    let x0 = x.max(0.0);
    let y0 = y.max(0.0);
    let x1 = (x + w).min(img_w);
    let y1 = (y + h).min(img_h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let px0 = x0.floor() as u32;
    let py0 = y0.floor() as u32;
    let px1 = (x1.ceil() as u32).min(width);
    let py1 = (y1.ceil() as u32).min(height);
    if px1 <= px0 || py1 <= py0 {
        return None;
    }

    Some(PixelRect {
        x: px0,
        y: py0,
        width: px1 - px0,
        height: py1 - py0,
    })
}

/// Crop one dish out of the meal image and encode it as PNG.
pub fn extract_region(img: &DynamicImage, bbox: &BoundingBox) -> AnalysisResult<Vec<u8>> {
    let (w, h) = img.dimensions();
    let rect = clamp_box(bbox, w, h).ok_or(AnalysisError::EmptyRegion {
        x: bbox.x,
        y: bbox.y,
        width: bbox.width,
        height: bbox.height,
        image_width: w,
        image_height: h,
    })?;

    let cropped = img.crop_imm(rect.x, rect.y, rect.width, rect.height);
    let mut png_bytes = Vec::new();
    cropped
        .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .map_err(|e| AnalysisError::RegionEncode(e.to_string()))?;
    Ok(png_bytes)
}

/// [`extract_region`] on the blocking pool; cropping and PNG encoding are CPU-bound.
pub async fn extract_region_async(
    img: Arc<DynamicImage>,
    bbox: BoundingBox,
) -> AnalysisResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || extract_region(&img, &bbox))
        .await
        .map_err(|e| AnalysisError::RegionEncode(format!("crop task failed: {e}")))?
}
