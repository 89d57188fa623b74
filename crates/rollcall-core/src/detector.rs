//! Face localization.
//!
//! [`FaceDetector`] is the seam for any face-detection backend. The bundled
//! backend is BlazeFace (short-range) running on ONNX Runtime; tests plug in
//! their own implementations.

use crate::types::RelativeBox;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const BLAZEFACE_INPUT_SIZE: usize = 128;
const BLAZEFACE_NUM_ANCHORS: usize = 896;
const BLAZEFACE_REGRESSOR_WIDTH: usize = 16;
/// (stride, anchors per cell) for the short-range model.
const BLAZEFACE_ANCHOR_LAYOUT: [(usize, usize); 2] = [(8, 2), (16, 6)];
const BLAZEFACE_NMS_THRESHOLD: f32 = 0.3;
const BLAZEFACE_SCORE_CLIP: f32 = 100.0;

/// Minimum detection confidence used when none is configured.
pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: place a BlazeFace ONNX export there")]
    ModelNotFound(String),
    #[error("invalid image: {width}x{height}")]
    InvalidImage { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face-detection capability.
///
/// Returns zero or more candidate boxes in relative coordinates, ranked
/// by the detector (best first). Implementations may keep inference state,
/// hence `&mut self`.
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RelativeBox>, DetectorError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RelativeBox>, DetectorError> {
        (**self).detect(image)
    }
}

/// Locate the face to describe in `image`.
///
/// Only the first candidate is used; no attempt is made to prefer the
/// largest or most central face in multi-face frames.
pub fn locate<D: FaceDetector + ?Sized>(
    detector: &mut D,
    image: &RgbImage,
) -> Result<Option<RelativeBox>, DetectorError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || image.as_raw().len() != width as usize * height as usize * 3 {
        return Err(DetectorError::InvalidImage { width, height });
    }

    let candidates = detector.detect(image)?;
    if candidates.len() > 1 {
        tracing::debug!(count = candidates.len(), "multiple faces detected; using the first");
    }
    Ok(candidates.into_iter().next())
}

/// BlazeFace short-range detector backed by an ONNX Runtime session.
pub struct BlazeFaceDetector {
    session: Session,
    min_confidence: f32,
    anchors: Vec<[f32; 2]>,
}

impl BlazeFaceDetector {
    /// Load a BlazeFace ONNX model from the given path.
    pub fn load(model_path: &Path, min_confidence: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded BlazeFace model"
        );

        Ok(Self {
            session,
            min_confidence,
            anchors: generate_anchors(),
        })
    }
}

impl FaceDetector for BlazeFaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RelativeBox>, DetectorError> {
        let input = preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        if outputs.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "BlazeFace model requires 2 outputs (regressors, scores), got {}",
                outputs.len()
            )));
        }

        // Output order differs between exports; tell them apart by size.
        let (_, first) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("output 0: {e}")))?;
        let (_, second) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("output 1: {e}")))?;
        let (regressors, scores) = if first.len() >= second.len() {
            (first, second)
        } else {
            (second, first)
        };

        if scores.len() < BLAZEFACE_NUM_ANCHORS
            || regressors.len() < BLAZEFACE_NUM_ANCHORS * BLAZEFACE_REGRESSOR_WIDTH
        {
            return Err(DetectorError::InferenceFailed(format!(
                "unexpected BlazeFace output sizes: regressors={}, scores={}",
                regressors.len(),
                scores.len()
            )));
        }

        let detections = decode(regressors, scores, &self.anchors, self.min_confidence);
        Ok(nms(detections, BLAZEFACE_NMS_THRESHOLD))
    }
}

/// Stretch-resize to 128×128 (nearest neighbour) and normalize to [-1, 1] NCHW.
///
/// Stretching keeps relative coordinates valid in the source frame.
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let (src_w, src_h) = (image.width() as usize, image.height() as usize);
    let s = BLAZEFACE_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));

    for y in 0..s {
        let src_y = (((y as f32 + 0.5) * src_h as f32 / s as f32) as usize).min(src_h - 1);
        for x in 0..s {
            let src_x = (((x as f32 + 0.5) * src_w as f32 / s as f32) as usize).min(src_w - 1);
            let px = image.get_pixel(src_x as u32, src_y as u32);
            for c in 0..3 {
                tensor[[0, c, y, x]] = px[c] as f32 / 127.5 - 1.0;
            }
        }
    }

    tensor
}

/// Anchor centres in relative coordinates: a 16×16 grid with 2 anchors per
/// cell followed by an 8×8 grid with 6.
fn generate_anchors() -> Vec<[f32; 2]> {
    let mut anchors = Vec::with_capacity(BLAZEFACE_NUM_ANCHORS);
    for &(stride, per_cell) in &BLAZEFACE_ANCHOR_LAYOUT {
        let grid = BLAZEFACE_INPUT_SIZE / stride;
        for y in 0..grid {
            for x in 0..grid {
                let cx = (x as f32 + 0.5) / grid as f32;
                let cy = (y as f32 + 0.5) / grid as f32;
                for _ in 0..per_cell {
                    anchors.push([cx, cy]);
                }
            }
        }
    }
    anchors
}

/// Decode anchor-relative regressions into relative boxes above `threshold`.
fn decode(regressors: &[f32], scores: &[f32], anchors: &[[f32; 2]], threshold: f32) -> Vec<RelativeBox> {
    let size = BLAZEFACE_INPUT_SIZE as f32;
    let mut boxes = Vec::new();

    for (i, anchor) in anchors.iter().enumerate() {
        let Some(&raw) = scores.get(i) else { break };
        let score = sigmoid(raw.clamp(-BLAZEFACE_SCORE_CLIP, BLAZEFACE_SCORE_CLIP));
        if score < threshold {
            continue;
        }

        let off = i * BLAZEFACE_REGRESSOR_WIDTH;
        let Some(reg) = regressors.get(off..off + 4) else { break };

        let cx = anchor[0] + reg[0] / size;
        let cy = anchor[1] + reg[1] / size;
        let w = reg[2] / size;
        let h = reg[3] / size;

        boxes.push(RelativeBox {
            xmin: cx - w / 2.0,
            ymin: cy - h / 2.0,
            width: w,
            height: h,
            confidence: score,
        });
    }

    boxes
}

/// Non-Maximum Suppression: keep the best box of each overlapping cluster.
/// The result is sorted by confidence, best first.
fn nms(mut detections: Vec<RelativeBox>, iou_threshold: f32) -> Vec<RelativeBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RelativeBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &RelativeBox, b: &RelativeBox) -> f32 {
    let x1 = a.xmin.max(b.xmin);
    let y1 = a.ymin.max(b.ymin);
    let x2 = (a.xmin + a.width).min(b.xmin + b.width);
    let y2 = (a.ymin + a.height).min(b.ymin + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
