//! Full-retrain classifier training over the sample store.
//!
//! Every run re-reads every sample of every identity, rebuilds descriptors,
//! fits a fresh forest and atomically replaces the model artifact. A
//! [`TrainingGate`] shared by all trainers of one store/model pair keeps
//! runs from overlapping.

use crate::descriptor;
use crate::detector::{DetectorError, FaceDetector};
use crate::forest::{Classifier, ForestError, ForestParams, RandomForest};
use crate::model::{ModelError, TrainedModel};
use crate::sample_store::{SampleStore, StoreError};
use crate::types::{Descriptor, Identity};
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Share of the progress range spent on descriptor extraction.
const EXTRACTION_PROGRESS: usize = 80;
const FIT_PROGRESS: u8 = 85;
const PERSIST_PROGRESS: u8 = 95;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no training data: the sample store has no identities")]
    NoTrainingData,
    #[error("no usable samples: no face was found in any stored image")]
    NoUsableSamples,
    #[error("a training run is already in progress")]
    AlreadyRunning,
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
    #[error("classifier: {0}")]
    Forest(#[from] ForestError),
    #[error("model artifact: {0}")]
    Model(#[from] ModelError),
    #[error("failed to start training thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("training thread panicked")]
    Panicked,
}

/// Advisory progress update, percent in 0..=100 and never decreasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainReport {
    pub identities: usize,
    pub samples_seen: usize,
    pub samples_used: usize,
    /// Identities that ended up with at least one usable descriptor.
    pub classes: Vec<Identity>,
}

impl TrainReport {
    pub fn samples_skipped(&self) -> usize {
        self.samples_seen - self.samples_used
    }
}

/// Single-training-at-a-time guard for one store/model pair.
#[derive(Clone, Default)]
pub struct TrainingGate {
    busy: Arc<AtomicBool>,
}

impl TrainingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<GatePass, TrainError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TrainError::AlreadyRunning)?;
        Ok(GatePass { busy: Arc::clone(&self.busy) })
    }
}

/// Releases the gate on drop, including on early error returns.
struct GatePass {
    busy: Arc<AtomicBool>,
}

impl Drop for GatePass {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Builds a classifier from a sample store and persists it.
///
/// Owns its detector so a concurrent predictor never waits on training.
pub struct Trainer<S: ?Sized, D> {
    store: Arc<S>,
    detector: D,
    model_path: PathBuf,
    params: ForestParams,
    gate: TrainingGate,
}

impl<S, D> Trainer<S, D>
where
    S: SampleStore + ?Sized,
    D: FaceDetector,
{
    pub fn new(store: Arc<S>, detector: D, model_path: impl Into<PathBuf>, gate: TrainingGate) -> Self {
        Self {
            store,
            detector,
            model_path: model_path.into(),
            params: ForestParams::default(),
            gate,
        }
    }

    pub fn with_params(mut self, params: ForestParams) -> Self {
        self.params = params;
        self
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Retrain from scratch and replace the model artifact.
    ///
    /// On any error the previous artifact is left untouched.
    pub fn train<F: FnMut(Progress)>(&mut self, progress: F) -> Result<TrainReport, TrainError> {
        let _pass = self.gate.acquire()?;
        self.train_unguarded(progress)
    }

    /// Body of [`train`](Self::train); the caller holds the gate.
    fn train_unguarded<F: FnMut(Progress)>(&mut self, mut progress: F) -> Result<TrainReport, TrainError> {
        let mut report = |percent: u8, message: String| progress(Progress { percent, message });

        report(0, "Starting training...".into());
        tracing::info!(model = %self.model_path.display(), "training started");

        let identities = self.store.list_identities()?;
        if identities.is_empty() {
            tracing::warn!("training aborted: sample store is empty");
            return Err(TrainError::NoTrainingData);
        }

        let mut rows: Vec<Descriptor> = Vec::new();
        let mut labels: Vec<Identity> = Vec::new();
        let mut samples_seen = 0usize;
        let total = identities.len();

        for (n, &identity) in identities.iter().enumerate() {
            let samples = self.store.list_samples(identity)?;
            let mut used = 0usize;
            for path in &samples {
                samples_seen += 1;
                if let Some(d) = self.describe_sample(identity, path)? {
                    rows.push(d);
                    labels.push(identity);
                    used += 1;
                }
            }
            tracing::debug!(%identity, samples = samples.len(), used, "identity processed");

            let percent = ((n + 1) * EXTRACTION_PROGRESS / total) as u8;
            report(percent, format!("Processing identity {}/{}", n + 1, total));
        }

        if rows.is_empty() {
            tracing::warn!(samples_seen, "training aborted: no usable samples");
            return Err(TrainError::NoUsableSamples);
        }

        report(FIT_PROGRESS, "Training model...".into());
        let forest = RandomForest::fit(&rows, &labels, &self.params)?;
        let classes = forest.classes().to_vec();

        report(PERSIST_PROGRESS, "Saving model...".into());
        TrainedModel::new(forest, rows.len()).save(&self.model_path)?;

        let summary = TrainReport {
            identities: total,
            samples_seen,
            samples_used: rows.len(),
            classes,
        };
        tracing::info!(
            identities = summary.identities,
            classes = summary.classes.len(),
            used = summary.samples_used,
            skipped = summary.samples_skipped(),
            "training complete"
        );
        report(100, "Training complete!".into());
        Ok(summary)
    }

    /// Descriptor for one stored sample, `None` if it must be skipped.
    fn describe_sample(&mut self, identity: Identity, path: &Path) -> Result<Option<Descriptor>, TrainError> {
        let image = match self.store.load_sample(path) {
            Ok(Some(image)) => image,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(%identity, path = %path.display(), error = %e, "unreadable sample; skipped");
                return Ok(None);
            }
        };

        match descriptor::describe(&mut self.detector, &image) {
            Ok(Some(d)) => Ok(Some(d)),
            Ok(None) => {
                tracing::debug!(%identity, path = %path.display(), "no face in sample; skipped");
                Ok(None)
            }
            Err(DetectorError::InvalidImage { width, height }) => {
                tracing::warn!(%identity, path = %path.display(), width, height, "invalid sample image; skipped");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<S, D> Trainer<S, D>
where
    S: SampleStore + ?Sized + 'static,
    D: FaceDetector + 'static,
{
    /// Run [`train`](Self::train) on a dedicated thread.
    ///
    /// Progress is streamed through [`TrainingJob::progress`]. The gate is
    /// taken before the thread starts, so an overlapping run fails here with
    /// `AlreadyRunning`.
    pub fn spawn(mut self) -> Result<TrainingJob, TrainError> {
        let pass = self.gate.acquire()?;

        let (tx, rx): (Sender<Progress>, Receiver<Progress>) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("rollcall-trainer".into())
            .spawn(move || {
                let _pass = pass;
                self.train_unguarded(|p| {
                    let _ = tx.send(p);
                })
            })
            .map_err(TrainError::Spawn)?;

        Ok(TrainingJob { progress: rx, handle })
    }
}

/// Handle to a background training run.
pub struct TrainingJob {
    progress: Receiver<Progress>,
    handle: JoinHandle<Result<TrainReport, TrainError>>,
}

impl TrainingJob {
    /// Progress updates; disconnects when the run ends.
    pub fn progress(&self) -> &Receiver<Progress> {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the run ends.
    pub fn wait(self) -> Result<TrainReport, TrainError> {
        self.handle.join().map_err(|_| TrainError::Panicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_store::MemorySampleStore;
    use crate::types::RelativeBox;
    use image::{Rgb, RgbImage};

    /// Finds a "face" covering the whole frame unless the frame is uniform.
    struct ContrastDetector;

    impl FaceDetector for ContrastDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<RelativeBox>, DetectorError> {
            let first = image.get_pixel(0, 0);
            Ok(if image.pixels().any(|p| p != first) {
                vec![RelativeBox::full_frame()]
            } else {
                vec![]
            })
        }
    }

    fn striped(vertical: bool, jitter: u8) -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            let coord = if vertical { x } else { y };
            let v = if coord < 32 { 200 } else { 40 };
            let v = v + ((x * 7 + y * 13 + jitter as u32) % 9) as u8;
            Rgb([v, v, v])
        })
    }

    fn params() -> ForestParams {
        ForestParams { n_trees: 10, ..ForestParams::default() }
    }

    #[test]
    fn test_empty_store_fails_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("face_model.json");
        let store = Arc::new(MemorySampleStore::new());
        let mut trainer = Trainer::new(store, ContrastDetector, &model_path, TrainingGate::new());

        assert!(matches!(trainer.train(|_| {}), Err(TrainError::NoTrainingData)));
        assert!(!model_path.exists());
    }

    #[test]
    fn test_no_usable_samples_keeps_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("face_model.json");
        std::fs::write(&model_path, b"previous").unwrap();

        let store = Arc::new(MemorySampleStore::new());
        for i in 0..3 {
            store.save(Identity(1), &RgbImage::from_pixel(32, 32, Rgb([90, 90, 90])), i).unwrap();
        }
        let mut trainer = Trainer::new(store, ContrastDetector, &model_path, TrainingGate::new());

        assert!(matches!(trainer.train(|_| {}), Err(TrainError::NoUsableSamples)));
        assert_eq!(std::fs::read(&model_path).unwrap(), b"previous");
    }

    #[test]
    fn test_progress_is_monotonic_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemorySampleStore::new());
        for i in 0..3 {
            store.save(Identity(1), &striped(true, i as u8), i).unwrap();
            store.save(Identity(2), &striped(false, i as u8), i).unwrap();
            store.save(Identity(3), &striped(true, 100 + i as u8), i).unwrap();
        }
        let mut trainer = Trainer::new(store, ContrastDetector, dir.path().join("m.json"), TrainingGate::new())
            .with_params(params());

        let mut seen = Vec::new();
        let report = trainer.train(|p| seen.push(p.percent)).unwrap();
        assert_eq!(report.samples_used, 9);
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    }

    #[test]
    fn test_skips_undetectable_samples() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemorySampleStore::new());
        store.save(Identity(4), &striped(true, 1), 0).unwrap();
        store.save(Identity(4), &RgbImage::from_pixel(64, 64, Rgb([0, 0, 0])), 1).unwrap();
        store.save(Identity(4), &RgbImage::new(0, 0), 2).unwrap();
        let mut trainer = Trainer::new(store, ContrastDetector, dir.path().join("m.json"), TrainingGate::new())
            .with_params(params());

        let report = trainer.train(|_| {}).unwrap();
        assert_eq!(report.samples_seen, 3);
        assert_eq!(report.samples_used, 1);
        assert_eq!(report.samples_skipped(), 2);
        assert_eq!(report.classes, vec![Identity(4)]);
    }

    #[test]
    fn test_gate_rejects_overlapping_runs() {
        let gate = TrainingGate::new();
        let pass = gate.acquire().unwrap();
        assert!(gate.is_busy());
        assert!(matches!(gate.acquire(), Err(TrainError::AlreadyRunning)));

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemorySampleStore::new());
        let mut trainer = Trainer::new(store, ContrastDetector, dir.path().join("m.json"), gate.clone());
        assert!(matches!(trainer.train(|_| {}), Err(TrainError::AlreadyRunning)));

        drop(pass);
        assert!(!gate.is_busy());
        assert!(matches!(trainer.train(|_| {}), Err(TrainError::NoTrainingData)));
        assert!(!gate.is_busy());
    }

    /// Full-frame detector that waits for a release signal before each call.
    struct HeldDetector(Receiver<()>);

    impl FaceDetector for HeldDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RelativeBox>, DetectorError> {
            let _ = self.0.recv();
            Ok(vec![RelativeBox::full_frame()])
        }
    }

    /// Deletes `victim` right after its samples are listed.
    struct VanishingStore {
        inner: MemorySampleStore,
        victim: Identity,
    }

    impl SampleStore for VanishingStore {
        fn save(&self, identity: Identity, image: &RgbImage, index: usize) -> Result<PathBuf, StoreError> {
            self.inner.save(identity, image, index)
        }

        fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
            self.inner.list_identities()
        }

        fn list_samples(&self, identity: Identity) -> Result<Vec<PathBuf>, StoreError> {
            let samples = self.inner.list_samples(identity)?;
            if identity == self.victim {
                self.inner.delete(identity)?;
            }
            Ok(samples)
        }

        fn load_sample(&self, path: &Path) -> Result<Option<RgbImage>, StoreError> {
            self.inner.load_sample(path)
        }

        fn delete(&self, identity: Identity) -> Result<(), StoreError> {
            self.inner.delete(identity)
        }
    }

    #[test]
    fn test_identity_removed_mid_run_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VanishingStore { inner: MemorySampleStore::new(), victim: Identity(2) });
        for i in 0..3 {
            store.save(Identity(1), &striped(true, i as u8), i).unwrap();
            store.save(Identity(2), &striped(false, i as u8), i).unwrap();
        }
        let mut trainer = Trainer::new(store, ContrastDetector, dir.path().join("m.json"), TrainingGate::new())
            .with_params(params());

        let report = trainer.train(|_| {}).unwrap();
        assert_eq!(report.identities, 2);
        assert_eq!(report.samples_seen, 6);
        assert_eq!(report.samples_used, 3);
        assert_eq!(report.classes, vec![Identity(1)]);
    }

    #[test]
    fn test_spawn_takes_gate_before_starting() {
        let dir = tempfile::tempdir().unwrap();
        let gate = TrainingGate::new();
        let store = Arc::new(MemorySampleStore::new());
        store.save(Identity(1), &striped(true, 0), 0).unwrap();

        let held = gate.acquire().unwrap();
        let blocked = Trainer::new(Arc::clone(&store), ContrastDetector, dir.path().join("m.json"), gate.clone());
        assert!(matches!(blocked.spawn(), Err(TrainError::AlreadyRunning)));
        drop(held);

        let (release, hold) = crossbeam_channel::unbounded();
        let job = Trainer::new(Arc::clone(&store), HeldDetector(hold), dir.path().join("m.json"), gate.clone())
            .with_params(params())
            .spawn()
            .unwrap();
        assert!(gate.is_busy());
        let second = Trainer::new(store, ContrastDetector, dir.path().join("m.json"), gate.clone());
        assert!(matches!(second.spawn(), Err(TrainError::AlreadyRunning)));

        release.send(()).unwrap();
        job.wait().unwrap();
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_spawn_streams_progress() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("face_model.json");
        let store = Arc::new(MemorySampleStore::new());
        for i in 0..4 {
            store.save(Identity(1), &striped(true, i as u8), i).unwrap();
            store.save(Identity(2), &striped(false, i as u8), i).unwrap();
        }
        let trainer = Trainer::new(store, ContrastDetector, &model_path, TrainingGate::new())
            .with_params(params());

        let job = trainer.spawn().unwrap();
        let updates: Vec<Progress> = job.progress().iter().collect();
        let report = job.wait().unwrap();

        assert_eq!(report.classes, vec![Identity(1), Identity(2)]);
        assert_eq!(updates.last().map(|p| p.percent), Some(100));
        assert!(TrainedModel::load(&model_path).unwrap().is_some());
    }
}
