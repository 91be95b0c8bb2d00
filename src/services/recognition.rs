//! Image recognition: face detection and moderation labels.
//!
//! The handler only consumes results. [`NullRecognition`] finds nothing,
//! which makes smart crop keep the whole image and moderation leave it alone.

use crate::error::HandlerError;
use crate::imaging::BoundingBox;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FaceDetail {
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModerationLabel {
    pub name: String,
    #[serde(default)]
    pub parent_name: String,
    pub confidence: f64,
}

#[derive(Error, Debug)]
pub enum RecognitionError {
    /// The recognition service rejected or failed the call.
    #[error("{code}: {message}")]
    Service {
        status: Option<u16>,
        code: String,
        message: String,
    },
}

impl From<RecognitionError> for HandlerError {
    fn from(err: RecognitionError) -> Self {
        match err {
            RecognitionError::Service {
                status,
                code,
                message,
            } => HandlerError::Recognition {
                status: status.unwrap_or(500),
                code,
                message,
            },
        }
    }
}

pub trait ImageRecognition: Sync {
    /// Faces in an encoded image, with boxes as fractions of the image size.
    fn detect_faces(&self, image: &[u8]) -> Result<Vec<FaceDetail>, RecognitionError>;

    fn detect_moderation_labels(
        &self,
        image: &[u8],
        min_confidence: f64,
    ) -> Result<Vec<ModerationLabel>, RecognitionError>;
}

/// Recognition that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecognition;

impl ImageRecognition for NullRecognition {
    fn detect_faces(&self, _image: &[u8]) -> Result<Vec<FaceDetail>, RecognitionError> {
        Ok(Vec::new())
    }

    fn detect_moderation_labels(
        &self,
        _image: &[u8],
        _min_confidence: f64,
    ) -> Result<Vec<ModerationLabel>, RecognitionError> {
        Ok(Vec::new())
    }
}
