//! Identification with a confidence gate.

use crate::descriptor;
use crate::detector::{DetectorError, FaceDetector};
use crate::forest::{Classifier, ForestError};
use crate::model::{ModelError, TrainedModel};
use crate::types::{Descriptor, Prediction};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Minimum winning-class probability for an identification to be accepted.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("classifier: {0}")]
    Classifier(#[from] ForestError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
}

/// Score `descriptor` and apply the confidence gate.
///
/// The most probable class wins (first on ties). Below `threshold` the
/// identity is withheld but the raw confidence is still reported.
pub fn classify<C: Classifier + ?Sized>(
    classifier: &C,
    descriptor: &Descriptor,
    threshold: f32,
) -> Result<Prediction, ForestError> {
    let probabilities = classifier.predict_proba(descriptor.as_slice())?;

    let mut best: Option<(usize, f32)> = None;
    for (i, &p) in probabilities.iter().enumerate() {
        if best.map_or(true, |(_, bp)| p > bp) {
            best = Some((i, p));
        }
    }
    let Some((idx, confidence)) = best else {
        return Ok(Prediction::none());
    };

    if confidence < threshold {
        return Ok(Prediction { identity: None, confidence });
    }

    Ok(Prediction {
        identity: classifier.classes().get(idx).copied(),
        confidence,
    })
}

/// Identify the first face in `image`.
///
/// Without a model, or without a usable face, the result is
/// [`Prediction::none`]; only malformed frames and backend failures error.
pub fn predict<D, C>(
    detector: &mut D,
    model: Option<&C>,
    image: &RgbImage,
    threshold: f32,
) -> Result<Prediction, PredictError>
where
    D: FaceDetector + ?Sized,
    C: Classifier + ?Sized,
{
    let Some(model) = model else {
        tracing::debug!("no trained model; identification skipped");
        return Ok(Prediction::none());
    };

    let Some(descriptor) = descriptor::describe(detector, image)? else {
        return Ok(Prediction::none());
    };

    let prediction = classify(model, &descriptor, threshold)?;
    tracing::debug!(
        identity = ?prediction.identity,
        confidence = prediction.confidence,
        threshold,
        "prediction"
    );
    Ok(prediction)
}

/// A detector paired with the current model snapshot.
///
/// The snapshot only changes on [`reload`](Self::reload), so a training run
/// replacing the artifact never disturbs in-flight predictions.
pub struct Recognizer<D> {
    detector: D,
    model_path: PathBuf,
    model: Option<Arc<TrainedModel>>,
}

impl<D: FaceDetector> Recognizer<D> {
    /// Create a recognizer and load the model if one has been trained.
    pub fn open(detector: D, model_path: impl Into<PathBuf>) -> Result<Self, ModelError> {
        let mut recognizer = Self {
            detector,
            model_path: model_path.into(),
            model: None,
        };
        recognizer.reload()?;
        Ok(recognizer)
    }

    /// Re-read the model artifact. Returns whether a model is now loaded.
    pub fn reload(&mut self) -> Result<bool, ModelError> {
        self.model = TrainedModel::load(&self.model_path)?.map(Arc::new);
        if self.model.is_none() {
            tracing::info!(path = %self.model_path.display(), "no trained model yet");
        }
        Ok(self.model.is_some())
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<Arc<TrainedModel>> {
        self.model.clone()
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn predict(&mut self, image: &RgbImage, threshold: f32) -> Result<Prediction, PredictError> {
        predict(&mut self.detector, self.model.as_deref(), image, threshold)
    }
}
