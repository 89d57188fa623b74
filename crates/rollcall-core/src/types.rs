use serde::{Deserialize, Serialize};
use std::fmt;

/// Side length of the square grayscale patch a descriptor is built from.
pub const DESCRIPTOR_SIDE: usize = 64;

/// Length of every descriptor vector (64 × 64).
pub const DESCRIPTOR_DIM: usize = DESCRIPTOR_SIDE * DESCRIPTOR_SIDE;

/// Opaque key of an enrolled person, assigned by the attendance ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub i64);

impl Identity {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Identity {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Face bounding box in coordinates relative to the image size.
///
/// Values are nominally in [0, 1] but detectors may report boxes that
/// overhang the frame edge; consumers clamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativeBox {
    pub xmin: f32,
    pub ymin: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl RelativeBox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32) -> Self {
        Self { xmin, ymin, width, height, confidence: 1.0 }
    }

    /// Box covering the whole frame.
    pub fn full_frame() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// Convert to absolute pixels clamped to a `width × height` image.
    ///
    /// Returns `None` when the clamped region is empty.
    pub fn to_pixels(&self, width: u32, height: u32) -> Option<PixelRegion> {
        if ![self.xmin, self.ymin, self.width, self.height].iter().all(|v| v.is_finite()) {
            return None;
        }

        let w = width as f32;
        let h = height as f32;

        // Truncation toward zero matches integer conversion of the clamped floats.
        let x1 = (self.xmin * w).max(0.0) as i64;
        let y1 = (self.ymin * h).max(0.0) as i64;
        let x2 = ((self.xmin + self.width) * w).min(w) as i64;
        let y2 = ((self.ymin + self.height) * h).min(h) as i64;

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(PixelRegion {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }
}

/// Non-empty rectangle in absolute pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Fixed-length appearance vector with components in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl AsRef<[f32]> for Descriptor {
    fn as_ref(&self) -> &[f32] {
        &self.values
    }
}

/// Outcome of one identification attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Accepted identity, `None` when rejected or nothing could be scored.
    pub identity: Option<Identity>,
    /// Winning class probability in [0, 1], reported even on rejection.
    pub confidence: f32,
}

impl Prediction {
    /// "No identification" with zero confidence.
    pub fn none() -> Self {
        Self { identity: None, confidence: 0.0 }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}
