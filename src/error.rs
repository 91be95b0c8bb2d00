//! Request-facing errors.
//!
//! Every failure that reaches a caller is one [`HandlerError`] variant with a
//! numeric status, a machine-readable code and a human message. Collaborator
//! errors are translated at module boundaries; anything uncategorized becomes
//! [`HandlerError::Internal`], whose detail is logged but never returned.
//!
//! | Variant | Status | Code |
//! |---|---|---|
//! | `RequestType` | 400 | `RequestTypeError` |
//! | `CannotDecodeRequest` | 400 | `DecodeRequest::CannotDecodeRequest` |
//! | `CannotReadPath` | 400 | `DecodeRequest::CannotReadPath` |
//! | `CannotAccessBucket` | 403 | `ImageBucket::CannotAccessBucket` |
//! | `NoSourceBuckets` | 400 | `GetAllowedSourceBuckets::NoSourceBuckets` |
//! | `NoSuchKey` | 404 | `NoSuchKey` |
//! | `Storage` | 500 | collaborator code |
//! | `AuthorizationQueryParameters` | 400 | `AuthorizationQueryParametersError` |
//! | `SignatureDoesNotMatch` | 403 | `SignatureDoesNotMatch` |
//! | `SignatureValidationFailure` | 500 | `SignatureValidationFailure` |
//! | `InvalidResize` | 400 | `InvalidResizeException` |
//! | `CropAreaOutOfBounds` | 400 | `Crop::AreaOutOfBounds` |
//! | `FaceIndexOutOfRange` | 400 | `SmartCrop::FaceIndexOutOfRange` |
//! | `PaddingOutOfBounds` | 400 | `SmartCrop::PaddingOutOfBounds` |
//! | `Recognition` | collaborator status | collaborator code |
//! | `UnsupportedOutputFormat` | 500 | `UnsupportedOutputImageFormatException` |
//! | `TooLargeImage` | 413 | `TooLargeImageException` |
//! | `Internal` | 500 | `InternalError` |

use crate::imaging::BackendError;
use serde::Serialize;
use thiserror::Error;

/// Message returned for every uncategorized failure.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error. Please contact the system administrator.";

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(
        "The type of request you are making could not be processed. Please ensure that your original image is of a supported file type (jpg/jpeg, png, tiff/tif, webp, svg, gif, avif) and that your image request is provided in the correct syntax. Refer to the documentation for additional guidance on forming image requests."
    )]
    RequestType,

    #[error(
        "The image request you provided could not be decoded. Please check that your request is base64 encoded properly and refer to the documentation for additional guidance."
    )]
    CannotDecodeRequest,

    #[error(
        "The URL path you provided could not be read. Please ensure that it is properly formed according to the solution documentation."
    )]
    CannotReadPath,

    #[error(
        "The bucket you specified could not be accessed. Please check that the bucket is specified in your SOURCE_BUCKETS."
    )]
    CannotAccessBucket,

    #[error(
        "The SOURCE_BUCKETS variable could not be read. Please check that it is not empty and contains at least one source bucket, or multiple buckets separated by commas."
    )]
    NoSourceBuckets,

    #[error("The image {key} does not exist or the request may not be base64 encoded properly.")]
    NoSuchKey { key: String },

    #[error("{message}")]
    Storage { code: String, message: String },

    #[error("Query-string requires the signature parameter.")]
    AuthorizationQueryParameters,

    #[error("Signature does not match.")]
    SignatureDoesNotMatch,

    #[error("Signature validation failed.")]
    SignatureValidationFailure,

    #[error("The image size is invalid.")]
    InvalidResize,

    #[error(
        "The cropping area you provided exceeds the boundaries of the original image. Please try choosing a correct cropping value."
    )]
    CropAreaOutOfBounds,

    #[error(
        "You have provided a FaceIndex value that exceeds the length of the zero-based detectedFaces array. Please specify a value that is in-range."
    )]
    FaceIndexOutOfRange,

    #[error(
        "The padding value you provided exceeds the boundaries of the original image. Please try choosing a smaller value or applying padding via Sharp for greater specificity."
    )]
    PaddingOutOfBounds,

    #[error("{message}")]
    Recognition {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Format to {format} not supported")]
    UnsupportedOutputFormat { format: String },

    #[error("The converted image is too large to return.")]
    TooLargeImage,

    /// The detail is for logs only; the response carries [`INTERNAL_ERROR_MESSAGE`].
    #[error("{INTERNAL_ERROR_MESSAGE}")]
    Internal(String),
}

impl HandlerError {
    pub fn status(&self) -> u16 {
        match self {
            HandlerError::RequestType
            | HandlerError::CannotDecodeRequest
            | HandlerError::CannotReadPath
            | HandlerError::NoSourceBuckets
            | HandlerError::AuthorizationQueryParameters
            | HandlerError::InvalidResize
            | HandlerError::CropAreaOutOfBounds
            | HandlerError::FaceIndexOutOfRange
            | HandlerError::PaddingOutOfBounds => 400,
            HandlerError::CannotAccessBucket | HandlerError::SignatureDoesNotMatch => 403,
            HandlerError::NoSuchKey { .. } => 404,
            HandlerError::TooLargeImage => 413,
            HandlerError::Recognition { status, .. } => *status,
            HandlerError::Storage { .. }
            | HandlerError::SignatureValidationFailure
            | HandlerError::UnsupportedOutputFormat { .. }
            | HandlerError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            HandlerError::RequestType => "RequestTypeError",
            HandlerError::CannotDecodeRequest => "DecodeRequest::CannotDecodeRequest",
            HandlerError::CannotReadPath => "DecodeRequest::CannotReadPath",
            HandlerError::CannotAccessBucket => "ImageBucket::CannotAccessBucket",
            HandlerError::NoSourceBuckets => "GetAllowedSourceBuckets::NoSourceBuckets",
            HandlerError::NoSuchKey { .. } => "NoSuchKey",
            HandlerError::Storage { code, .. } => code,
            HandlerError::AuthorizationQueryParameters => "AuthorizationQueryParametersError",
            HandlerError::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            HandlerError::SignatureValidationFailure => "SignatureValidationFailure",
            HandlerError::InvalidResize => "InvalidResizeException",
            HandlerError::CropAreaOutOfBounds => "Crop::AreaOutOfBounds",
            HandlerError::FaceIndexOutOfRange => "SmartCrop::FaceIndexOutOfRange",
            HandlerError::PaddingOutOfBounds => "SmartCrop::PaddingOutOfBounds",
            HandlerError::Recognition { code, .. } => code,
            HandlerError::UnsupportedOutputFormat { .. } => "UnsupportedOutputImageFormatException",
            HandlerError::TooLargeImage => "TooLargeImageException",
            HandlerError::Internal(_) => "InternalError",
        }
    }

    /// The JSON body returned to callers.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status: self.status(),
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<BackendError> for HandlerError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::UnsupportedFormat(format) => HandlerError::UnsupportedOutputFormat {
                format: format.to_string(),
            },
            other => HandlerError::Internal(other.to_string()),
        }
    }
}

/// Serialized error payload: `{"status":…,"code":…,"message":…}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub code: String,
    pub message: String,
}
