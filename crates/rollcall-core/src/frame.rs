//! Frame helpers: raw buffer validation, BT.601 luma and area-averaging resize.

use image::{ImageBuffer, Rgb, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid image: {width}x{height} with {channels} channel(s)")]
    InvalidImage { width: u32, height: u32, channels: u8 },
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Build an RGB frame from a raw interleaved buffer.
///
/// Accepts 3-channel RGB and 4-channel RGBA (alpha is dropped). Zero-sized
/// frames, any other channel count and buffers whose length is not exactly
/// `width × height × channels` are rejected.
pub fn frame_from_raw(data: &[u8], width: u32, height: u32, channels: u8) -> Result<RgbImage, FrameError> {
    if width == 0 || height == 0 || !matches!(channels, 3 | 4) {
        return Err(FrameError::InvalidImage { width, height, channels });
    }

    let expected = width as usize * height as usize * channels as usize;
    if data.len() != expected {
        return Err(FrameError::InvalidLength { expected, actual: data.len() });
    }

    let rgb: Vec<u8> = if channels == 3 {
        data.to_vec()
    } else {
        data.chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect()
    };

    ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, rgb)
        .ok_or(FrameError::InvalidLength { expected, actual: data.len() })
}

/// Convert an RGB image to 8-bit luma using ITU-R BT.601 weights.
pub fn to_luma(image: &RgbImage) -> Vec<u8> {
    image
        .pixels()
        .map(|Rgb([r, g, b])| {
            let y = 0.299 * *r as f32 + 0.587 * *g as f32 + 0.114 * *b as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Resize a single-channel image with area averaging.
///
/// Each output pixel is the coverage-weighted mean of the source pixels
/// under its footprint. When upscaling this degenerates to a box filter
/// blending at most two source pixels per axis.
pub fn resize_area(gray: &[u8], width: usize, height: usize, out_w: usize, out_h: usize) -> Vec<u8> {
    if width == 0 || height == 0 || out_w == 0 || out_h == 0 || gray.len() < width * height {
        return vec![0; out_w * out_h];
    }

    if width == out_w && height == out_h {
        return gray[..width * height].to_vec();
    }

    let x_spans = area_spans(width, out_w);
    let y_spans = area_spans(height, out_h);

    let mut out = vec![0u8; out_w * out_h];
    for (oy, row_span) in y_spans.iter().enumerate() {
        for (ox, col_span) in x_spans.iter().enumerate() {
            let mut acc = 0.0f64;
            let mut weight = 0.0f64;
            for &(sy, wy) in row_span {
                let row = &gray[sy * width..(sy + 1) * width];
                for &(sx, wx) in col_span {
                    let w = wy * wx;
                    acc += row[sx] as f64 * w;
                    weight += w;
                }
            }
            let val = if weight > 0.0 { acc / weight } else { 0.0 };
            out[oy * out_w + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// For every destination index, the source indices it overlaps and the
/// length of each overlap (in source pixel units).
fn area_spans(src: usize, dst: usize) -> Vec<Vec<(usize, f64)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = (start + scale).min(src as f64);
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(src);

            (first..last)
                .filter_map(|s| {
                    let overlap = (end.min(s as f64 + 1.0) - start.max(s as f64)).max(0.0);
                    (overlap > 1e-9).then_some((s, overlap))
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_raw_rgb() {
        let data = vec![10u8, 20, 30, 40, 50, 60];
        let img = frame_from_raw(&data, 2, 1, 3).unwrap();
        assert_eq!(img.get_pixel(1, 0), &Rgb([40, 50, 60]));
    }

    #[test]
    fn test_frame_from_raw_drops_alpha() {
        let data = vec![1u8, 2, 3, 255, 4, 5, 6, 0];
        let img = frame_from_raw(&data, 2, 1, 4).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Rgb([1, 2, 3]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([4, 5, 6]));
    }

    #[test]
    fn test_frame_from_raw_rejects_bad_channels() {
        assert!(matches!(
            frame_from_raw(&[0u8; 8], 2, 2, 2),
            Err(FrameError::InvalidImage { channels: 2, .. })
        ));
        assert!(matches!(frame_from_raw(&[0u8; 4], 2, 2, 1), Err(FrameError::InvalidImage { .. })));
    }

    #[test]
    fn test_frame_from_raw_rejects_zero_size() {
        assert!(matches!(frame_from_raw(&[], 0, 10, 3), Err(FrameError::InvalidImage { .. })));
    }

    #[test]
    fn test_frame_from_raw_short_buffer() {
        assert!(matches!(
            frame_from_raw(&[0u8; 5], 2, 1, 3),
            Err(FrameError::InvalidLength { expected: 6, actual: 5 })
        ));
    }

    #[test]
    fn test_frame_from_raw_long_buffer() {
        assert!(matches!(
            frame_from_raw(&[0u8; 7], 2, 1, 3),
            Err(FrameError::InvalidLength { expected: 6, actual: 7 })
        ));
        assert!(matches!(
            frame_from_raw(&[0u8; 12], 2, 1, 4),
            Err(FrameError::InvalidLength { expected: 8, actual: 12 })
        ));
    }

    #[test]
    fn test_to_luma_weights() {
        let img = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        });
        assert_eq!(to_luma(&img), vec![76, 150, 29]);
    }

    #[test]
    fn test_resize_area_halves_by_averaging() {
        // 4x2 → 2x1: each output averages a 2x2 block.
        let gray = vec![0u8, 100, 200, 200, 100, 200, 200, 200];
        let out = resize_area(&gray, 4, 2, 2, 1);
        assert_eq!(out, vec![100, 200]);
    }

    #[test]
    fn test_resize_area_fractional_footprint() {
        // 3 → 2: outputs cover [0, 1.5) and [1.5, 3).
        let gray = vec![0u8, 90, 180];
        let out = resize_area(&gray, 3, 1, 2, 1);
        // (0*1 + 90*0.5) / 1.5 = 30, (90*0.5 + 180*1) / 1.5 = 150
        assert_eq!(out, vec![30, 150]);
    }

    #[test]
    fn test_resize_area_uniform_stays_uniform() {
        let gray = vec![77u8; 123 * 97];
        let out = resize_area(&gray, 123, 97, 64, 64);
        assert_eq!(out.len(), 64 * 64);
        assert!(out.iter().all(|&p| p == 77));
    }

    #[test]
    fn test_resize_area_upscale() {
        let gray = vec![10u8, 20, 30, 40];
        let out = resize_area(&gray, 2, 2, 4, 4);
        assert_eq!(out.len(), 16);
        assert_eq!(out[0], 10);
        assert_eq!(out[15], 40);
    }

    #[test]
    fn test_resize_area_identity() {
        let gray: Vec<u8> = (0..16).collect();
        assert_eq!(resize_area(&gray, 4, 4, 4, 4), gray);
    }
}
