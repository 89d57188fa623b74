use rollcall_core::detector::DEFAULT_DETECTION_CONFIDENCE;
use rollcall_core::DEFAULT_CONFIDENCE_THRESHOLD;
use serde::Serialize;
use std::path::PathBuf;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Root for everything rollcall persists.
    pub data_dir: PathBuf,
    /// Sample store root (`<id>/face_<i>.jpg` underneath).
    pub dataset_dir: PathBuf,
    /// Trained model artifact.
    pub model_path: PathBuf,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// BlazeFace short-range ONNX model.
    pub detector_model: PathBuf,
    /// Minimum class probability for an identification to be accepted.
    pub confidence_threshold: f32,
    /// Minimum detector score for a face candidate.
    pub detection_confidence: f32,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Self {
            dataset_dir: env_path("ROLLCALL_DATASET_DIR", || data_dir.join("dataset")),
            model_path: env_path("ROLLCALL_MODEL_PATH", || data_dir.join("face_model.json")),
            db_path: env_path("ROLLCALL_DB_PATH", || data_dir.join("attendance.db")),
            detector_model: env_path("ROLLCALL_DETECTOR_MODEL", || {
                data_dir.join("models").join("blazeface.onnx")
            }),
            confidence_threshold: env_f32("ROLLCALL_CONFIDENCE_THRESHOLD", DEFAULT_CONFIDENCE_THRESHOLD),
            detection_confidence: env_f32("ROLLCALL_DETECTION_CONFIDENCE", DEFAULT_DETECTION_CONFIDENCE),
            data_dir,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_path(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| default())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
