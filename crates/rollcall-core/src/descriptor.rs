//! Descriptor extraction: crop → luma → 64×64 area resize → [0, 1].
//!
//! The descriptor is raw normalized intensity, so it is sensitive to pose
//! and lighting. Changing any step here invalidates every trained model.

use crate::detector::{self, DetectorError, FaceDetector};
use crate::frame;
use crate::types::{Descriptor, RelativeBox, DESCRIPTOR_SIDE};
use image::{imageops, RgbImage};

const MAX_INTENSITY: f32 = 255.0;

/// Extract a descriptor for `region` of `image`.
///
/// Returns `None` when the region, clamped to the image bounds, is empty.
pub fn extract(image: &RgbImage, region: &RelativeBox) -> Option<Descriptor> {
    let (width, height) = image.dimensions();
    let px = region.to_pixels(width, height)?;

    let crop = imageops::crop_imm(image, px.x, px.y, px.width, px.height).to_image();
    let gray = frame::to_luma(&crop);
    let resized = frame::resize_area(
        &gray,
        px.width as usize,
        px.height as usize,
        DESCRIPTOR_SIDE,
        DESCRIPTOR_SIDE,
    );

    Some(Descriptor {
        values: resized.iter().map(|&p| p as f32 / MAX_INTENSITY).collect(),
    })
}

/// Locate the first face in `image` and describe it.
///
/// `Ok(None)` covers both "no face" and "face box fell outside the frame".
pub fn describe<D: FaceDetector + ?Sized>(
    detector: &mut D,
    image: &RgbImage,
) -> Result<Option<Descriptor>, DetectorError> {
    let Some(region) = detector::locate(detector, image)? else {
        return Ok(None);
    };
    let descriptor = extract(image, &region);
    if descriptor.is_none() {
        tracing::debug!(?region, "face box empty after clamping to frame");
    }
    Ok(descriptor)
}
