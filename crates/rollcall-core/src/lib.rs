//! rollcall-core: face identification for attendance.
//!
//! Turns face crops into fixed-size intensity descriptors, fits a
//! random-forest classifier over enrolled identities, and identifies faces
//! in new frames behind a confidence gate.

pub mod descriptor;
pub mod detector;
pub mod forest;
pub mod frame;
pub mod model;
pub mod predictor;
pub mod sample_store;
pub mod trainer;
pub mod types;

pub use detector::{BlazeFaceDetector, DetectorError, FaceDetector};
pub use forest::{Classifier, ForestParams, RandomForest};
pub use model::{ModelError, TrainedModel};
pub use predictor::{predict, PredictError, Recognizer, DEFAULT_CONFIDENCE_THRESHOLD};
pub use sample_store::{FsSampleStore, MemorySampleStore, SampleStore, StoreError};
pub use trainer::{Progress, TrainError, TrainReport, Trainer, TrainingGate, TrainingJob};
pub use types::{Descriptor, Identity, Prediction, RelativeBox, DESCRIPTOR_DIM};
