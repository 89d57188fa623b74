//! Enrollment sample storage.
//!
//! On disk the store is one directory per identity, named by its integer key,
//! holding `face_<index>.jpg` files. The layout is read back on every
//! training pass and must stay stable.

use crate::types::Identity;
use image::{ImageFormat, RgbImage};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

const SAMPLE_PREFIX: &str = "face_";
const SAMPLE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sample store I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode sample {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unknown sample: {0}")]
    UnknownSample(PathBuf),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

/// Per-identity collections of raw enrollment images.
pub trait SampleStore: Send + Sync {
    /// Store `image` as sample `index` of `identity`, returning its location.
    fn save(&self, identity: Identity, image: &RgbImage, index: usize) -> Result<PathBuf, StoreError>;

    /// Every identity with a sample collection, in ascending order.
    fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// Sample locations of `identity` in ascending index order. Empty if unknown.
    fn list_samples(&self, identity: Identity) -> Result<Vec<PathBuf>, StoreError>;

    /// Decode one sample. `Ok(None)` if it exists but cannot be decoded.
    fn load_sample(&self, path: &Path) -> Result<Option<RgbImage>, StoreError>;

    /// Remove all samples of `identity`. Succeeds if there are none.
    fn delete(&self, identity: Identity) -> Result<(), StoreError>;
}

/// Filesystem-backed store rooted at a dataset directory.
pub struct FsSampleStore {
    root: PathBuf,
}

impl FsSampleStore {
    /// Open (and create if needed) the dataset directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_dir(&self, identity: Identity) -> PathBuf {
        self.root.join(identity.to_string())
    }
}

impl SampleStore for FsSampleStore {
    fn save(&self, identity: Identity, image: &RgbImage, index: usize) -> Result<PathBuf, StoreError> {
        let dir = self.identity_dir(identity);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let path = dir.join(format!("{SAMPLE_PREFIX}{index}.jpg"));
        image
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|source| StoreError::Encode { path: path.clone(), source })?;

        tracing::debug!(%identity, index, path = %path.display(), "sample saved");
        Ok(path)
    }

    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;

        let mut identities = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(|n| n.parse::<i64>().ok()) {
                Some(id) => identities.push(Identity(id)),
                None => tracing::warn!(dir = ?name, "ignoring non-identity directory in sample store"),
            }
        }

        identities.sort_unstable();
        Ok(identities)
    }

    fn list_samples(&self, identity: Identity) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.identity_dir(identity);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut samples = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if path.is_file() && has_sample_extension(&path) {
                samples.push(path);
            }
        }

        samples.sort_by(|a, b| sample_index(a).cmp(&sample_index(b)).then_with(|| a.cmp(b)));
        Ok(samples)
    }

    fn load_sample(&self, path: &Path) -> Result<Option<RgbImage>, StoreError> {
        match image::open(path) {
            Ok(img) => Ok(Some(img.to_rgb8())),
            Err(image::ImageError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::UnknownSample(path.to_path_buf()))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "undecodable sample");
                Ok(None)
            }
        }
    }

    fn delete(&self, identity: Identity) -> Result<(), StoreError> {
        let dir = self.identity_dir(identity);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(%identity, "samples deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }
}

fn has_sample_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SAMPLE_EXTENSIONS.iter().any(|ok| e.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}

/// Numeric index of `face_<n>.<ext>`; unnumbered files sort last.
fn sample_index(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(SAMPLE_PREFIX))
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

/// In-memory store with the same contract, for tests and embedding.
///
/// Locations are synthetic `<identity>/face_<index>` paths.
#[derive(Default)]
pub struct MemorySampleStore {
    samples: RwLock<BTreeMap<Identity, BTreeMap<usize, RgbImage>>>,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn location(identity: Identity, index: usize) -> PathBuf {
        PathBuf::from(identity.to_string()).join(format!("{SAMPLE_PREFIX}{index}"))
    }

    fn parse_location(path: &Path) -> Option<(Identity, usize)> {
        let identity = path.parent()?.to_str()?.parse().ok()?;
        let index = path.file_name()?.to_str()?.strip_prefix(SAMPLE_PREFIX)?.parse().ok()?;
        Some((Identity(identity), index))
    }
}

impl SampleStore for MemorySampleStore {
    fn save(&self, identity: Identity, image: &RgbImage, index: usize) -> Result<PathBuf, StoreError> {
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        samples.entry(identity).or_default().insert(index, image.clone());
        Ok(Self::location(identity, index))
    }

    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        Ok(samples.keys().copied().collect())
    }

    fn list_samples(&self, identity: Identity) -> Result<Vec<PathBuf>, StoreError> {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        Ok(samples
            .get(&identity)
            .map(|by_index| by_index.keys().map(|&i| Self::location(identity, i)).collect())
            .unwrap_or_default())
    }

    fn load_sample(&self, path: &Path) -> Result<Option<RgbImage>, StoreError> {
        let (identity, index) =
            Self::parse_location(path).ok_or_else(|| StoreError::UnknownSample(path.to_path_buf()))?;
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        samples
            .get(&identity)
            .and_then(|by_index| by_index.get(&index))
            .cloned()
            .map(Some)
            .ok_or_else(|| StoreError::UnknownSample(path.to_path_buf()))
    }

    fn delete(&self, identity: Identity) -> Result<(), StoreError> {
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        samples.remove(&identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample_image(shade: u8) -> RgbImage {
        RgbImage::from_fn(32, 32, |x, y| Rgb([shade, (x * 8) as u8, (y * 8) as u8]))
    }

    #[test]
    fn test_fs_save_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSampleStore::open(dir.path()).unwrap();

        let path = store.save(Identity(12), &sample_image(10), 3).unwrap();
        assert_eq!(path, dir.path().join("12").join("face_3.jpg"));
        assert!(path.is_file());
    }

    #[test]
    fn test_fs_lists_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSampleStore::open(dir.path()).unwrap();

        for id in [10, 2, 33] {
            store.save(Identity(id), &sample_image(0), 0).unwrap();
        }
        for index in [10, 2, 1] {
            store.save(Identity(2), &sample_image(0), index).unwrap();
        }

        assert_eq!(
            store.list_identities().unwrap(),
            vec![Identity(2), Identity(10), Identity(33)]
        );
        let names: Vec<String> = store
            .list_samples(Identity(2))
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["face_0.jpg", "face_1.jpg", "face_2.jpg", "face_10.jpg"]);
    }

    #[test]
    fn test_fs_ignores_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSampleStore::open(dir.path()).unwrap();
        store.save(Identity(1), &sample_image(0), 0).unwrap();

        fs::create_dir(dir.path().join("not-a-number")).unwrap();
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();
        fs::write(dir.path().join("1").join("notes.txt"), b"x").unwrap();

        assert_eq!(store.list_identities().unwrap(), vec![Identity(1)]);
        assert_eq!(store.list_samples(Identity(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_fs_load_roundtrip_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSampleStore::open(dir.path()).unwrap();
        let path = store.save(Identity(5), &sample_image(200), 0).unwrap();

        let loaded = store.load_sample(&path).unwrap().unwrap();
        assert_eq!(loaded.dimensions(), (32, 32));
    }

    #[test]
    fn test_fs_undecodable_sample_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSampleStore::open(dir.path()).unwrap();
        let id_dir = dir.path().join("4");
        fs::create_dir(&id_dir).unwrap();
        let path = id_dir.join("face_0.jpg");
        fs::write(&path, b"definitely not a jpeg").unwrap();

        assert!(store.load_sample(&path).unwrap().is_none());
    }

    #[test]
    fn test_fs_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSampleStore::open(dir.path()).unwrap();
        store.save(Identity(8), &sample_image(0), 0).unwrap();

        store.delete(Identity(8)).unwrap();
        assert!(!dir.path().join("8").exists());
        store.delete(Identity(8)).unwrap();
        store.delete(Identity(999)).unwrap();
        assert!(store.list_samples(Identity(8)).unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemorySampleStore::new();
        store.save(Identity(3), &sample_image(1), 1).unwrap();
        let first = store.save(Identity(3), &sample_image(2), 0).unwrap();
        store.save(Identity(1), &sample_image(3), 0).unwrap();

        assert_eq!(store.list_identities().unwrap(), vec![Identity(1), Identity(3)]);
        let samples = store.list_samples(Identity(3)).unwrap();
        assert_eq!(samples, vec![first.clone(), PathBuf::from("3").join("face_1")]);

        let loaded = store.load_sample(&first).unwrap().unwrap();
        assert_eq!(loaded.get_pixel(0, 0)[0], 2);

        store.delete(Identity(3)).unwrap();
        store.delete(Identity(3)).unwrap();
        assert_eq!(store.list_identities().unwrap(), vec![Identity(1)]);
        assert!(matches!(store.load_sample(&first), Err(StoreError::UnknownSample(_))));
    }
}
