//! Enrollment: register a person and keep the captures that show a face.

use crate::ledger::{Ledger, LedgerError, NewIdentity};
use image::RgbImage;
use rollcall_core::{descriptor, DetectorError, FaceDetector, Identity, SampleStore, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("no face detected in any of the {total} image(s)")]
    NoFaces { total: usize },
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
}

/// Result of a successful enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrolled {
    pub id: Identity,
    /// Captures with a usable face, stored under their capture index.
    pub valid: usize,
    pub total: usize,
}

/// Create `new` in the ledger and store every capture with a usable face.
///
/// Captures without a face are dropped. If none remain, nothing is created;
/// if a save fails, the identity and any samples already written are removed.
pub fn enroll<D, S>(
    ledger: &mut Ledger,
    store: &S,
    detector: &mut D,
    new: &NewIdentity,
    frames: &[RgbImage],
) -> Result<Enrolled, EnrollError>
where
    D: FaceDetector + ?Sized,
    S: SampleStore + ?Sized,
{
    if new.name.trim().is_empty() {
        return Err(EnrollError::EmptyName);
    }

    let mut usable = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        match descriptor::describe(detector, frame) {
            Ok(Some(_)) => usable.push(index),
            Ok(None) => tracing::debug!(index, "no face in capture; dropped"),
            Err(DetectorError::InvalidImage { width, height }) => {
                tracing::warn!(index, width, height, "invalid capture; dropped");
            }
            Err(e) => return Err(e.into()),
        }
    }
    if usable.is_empty() {
        return Err(EnrollError::NoFaces { total: frames.len() });
    }

    let id = ledger.create_identity(new)?;
    for &index in &usable {
        if let Err(e) = store.save(id, &frames[index], index) {
            rollback(ledger, store, id);
            return Err(e.into());
        }
    }

    tracing::info!(%id, valid = usable.len(), total = frames.len(), "identity enrolled");
    Ok(Enrolled {
        id,
        valid: usable.len(),
        total: frames.len(),
    })
}

fn rollback<S: SampleStore + ?Sized>(ledger: &mut Ledger, store: &S, id: Identity) {
    if let Err(e) = store.delete(id) {
        tracing::warn!(%id, error = %e, "rollback: failed to delete partial samples");
    }
    if let Err(e) = ledger.delete_identity(id) {
        tracing::warn!(%id, error = %e, "rollback: failed to delete identity");
    }
}
