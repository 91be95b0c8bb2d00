//! Shared test doubles for collaborators.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::StaticRecognition;
//!
//! let recognition = StaticRecognition::with_faces(vec![face]);
//! apply_edits(&backend, &mut image, &edits, Services { store: &store, recognition: &recognition })?;
//! ```

use crate::services::{FaceDetail, ImageRecognition, ModerationLabel, RecognitionError};
use std::sync::Mutex;

// =========================================================================
// Recognition
// =========================================================================

/// Recognition returning canned results, remembering the last confidence asked for.
#[derive(Default)]
pub struct StaticRecognition {
    faces: Vec<FaceDetail>,
    labels: Vec<ModerationLabel>,
    pub last_min_confidence: Mutex<Option<f64>>,
}

impl StaticRecognition {
    pub fn with_faces(faces: Vec<FaceDetail>) -> Self {
        Self {
            faces,
            ..Self::default()
        }
    }

    pub fn with_labels(labels: Vec<ModerationLabel>) -> Self {
        Self {
            labels,
            ..Self::default()
        }
    }

    pub fn min_confidence(&self) -> Option<f64> {
        *self.last_min_confidence.lock().unwrap()
    }
}

impl ImageRecognition for StaticRecognition {
    fn detect_faces(&self, _image: &[u8]) -> Result<Vec<FaceDetail>, RecognitionError> {
        Ok(self.faces.clone())
    }

    fn detect_moderation_labels(
        &self,
        _image: &[u8],
        min_confidence: f64,
    ) -> Result<Vec<ModerationLabel>, RecognitionError> {
        *self.last_min_confidence.lock().unwrap() = Some(min_confidence);
        Ok(self.labels.clone())
    }
}

/// Recognition whose every call fails with a service error.
pub struct FailingRecognition;

impl ImageRecognition for FailingRecognition {
    fn detect_faces(&self, _image: &[u8]) -> Result<Vec<FaceDetail>, RecognitionError> {
        Err(unavailable())
    }

    fn detect_moderation_labels(
        &self,
        _image: &[u8],
        _min_confidence: f64,
    ) -> Result<Vec<ModerationLabel>, RecognitionError> {
        Err(unavailable())
    }
}

fn unavailable() -> RecognitionError {
    RecognitionError::Service {
        status: Some(503),
        code: "ServiceUnavailable".into(),
        message: "recognition is down".into(),
    }
}
