//! The persisted classifier artifact.

use crate::forest::{Classifier, ForestError, RandomForest};
use crate::types::{Identity, DESCRIPTOR_DIM};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bumped whenever the artifact layout changes.
const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("model artifact {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("model artifact format {found} is not supported (expected {expected})")]
    UnsupportedFormat { found: u32, expected: u32 },
    #[error("model was trained on {found}-dim descriptors, this build produces {expected}; retrain required")]
    IncompatibleDescriptor { found: usize, expected: usize },
    #[error(transparent)]
    Forest(#[from] ForestError),
}

/// A fitted identity classifier plus provenance.
///
/// Immutable once loaded; share it behind an `Arc` between predictors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub format_version: u32,
    pub descriptor_dim: usize,
    pub trained_at: DateTime<Utc>,
    /// Descriptors the forest was fitted on.
    pub sample_count: usize,
    forest: RandomForest,
}

impl TrainedModel {
    pub fn new(forest: RandomForest, sample_count: usize) -> Self {
        Self {
            format_version: MODEL_FORMAT_VERSION,
            descriptor_dim: forest.n_features(),
            trained_at: Utc::now(),
            sample_count,
            forest,
        }
    }

    pub fn forest(&self) -> &RandomForest {
        &self.forest
    }

    /// Load the artifact at `path`. `Ok(None)` if no model has been trained.
    pub fn load(path: &Path) -> Result<Option<Self>, ModelError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ModelError::Io { path: path.to_path_buf(), source }),
        };

        let model: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| ModelError::Malformed { path: path.to_path_buf(), source })?;

        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(ModelError::UnsupportedFormat {
                found: model.format_version,
                expected: MODEL_FORMAT_VERSION,
            });
        }
        if model.descriptor_dim != DESCRIPTOR_DIM || model.forest.n_features() != DESCRIPTOR_DIM {
            return Err(ModelError::IncompatibleDescriptor {
                found: model.forest.n_features(),
                expected: DESCRIPTOR_DIM,
            });
        }
        model.forest.validate()?;

        tracing::info!(
            path = %path.display(),
            classes = model.classes().len(),
            trees = model.forest.n_trees(),
            samples = model.sample_count,
            trained_at = %model.trained_at,
            "loaded trained model"
        );
        Ok(Some(model))
    }

    /// Atomically replace the artifact at `path`.
    ///
    /// Serializes into a temporary file beside `path`, syncs it, then renames
    /// it over the target. Readers see either the old or the new artifact.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let io_err = |source: io::Error| ModelError::Io { path: path.to_path_buf(), source };

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".face_model")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(io_err)?;

        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, self)
                .map_err(|source| ModelError::Malformed { path: path.to_path_buf(), source })?;
            writer.flush().map_err(io_err)?;
        }
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        tracing::info!(path = %path.display(), classes = self.classes().len(), "trained model persisted");
        Ok(())
    }
}

impl Classifier for TrainedModel {
    fn classes(&self) -> &[Identity] {
        self.forest.classes()
    }

    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, ForestError> {
        self.forest.predict_proba(features)
    }
}

/// Whether a model artifact exists at `path`.
pub fn is_trained(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestParams;

    fn tiny_model() -> TrainedModel {
        let mut a = vec![0.1f32; DESCRIPTOR_DIM];
        let mut b = vec![0.9f32; DESCRIPTOR_DIM];
        a[0] = 0.0;
        b[0] = 1.0;
        let params = ForestParams { n_trees: 3, ..ForestParams::default() };
        let forest = RandomForest::fit(&[a, b], &[Identity(1), Identity(2)], &params).unwrap();
        TrainedModel::new(forest, 2)
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TrainedModel::load(&dir.path().join("face_model.json")).unwrap().is_none());
        assert!(!is_trained(&dir.path().join("face_model.json")));
    }

    #[test]
    fn test_save_then_load_predicts_the_same() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("face_model.json");
        let model = tiny_model();
        model.save(&path).unwrap();
        assert!(is_trained(&path));

        let loaded = TrainedModel::load(&path).unwrap().unwrap();
        assert_eq!(loaded.classes(), model.classes());
        assert_eq!(loaded.sample_count, 2);
        let query = vec![0.85f32; DESCRIPTOR_DIM];
        assert_eq!(
            loaded.predict_proba(&query).unwrap(),
            model.predict_proba(&query).unwrap()
        );
    }

    #[test]
    fn test_save_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face_model.json");
        std::fs::write(&path, b"old").unwrap();

        tiny_model().save(&path).unwrap();
        assert!(TrainedModel::load(&path).unwrap().is_some());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face_model.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(TrainedModel::load(&path), Err(ModelError::Malformed { .. })));
    }

    #[test]
    fn test_load_rejects_other_descriptor_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face_model.json");
        let params = ForestParams { n_trees: 1, ..ForestParams::default() };
        let forest = RandomForest::fit(&[vec![0.0f32; 8]], &[Identity(1)], &params).unwrap();
        TrainedModel::new(forest, 1).save(&path).unwrap();

        assert!(matches!(
            TrainedModel::load(&path),
            Err(ModelError::IncompatibleDescriptor { found: 8, .. })
        ));
    }
}
