//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait is the capability the edit sequencer drives:
//! decode bytes, report what the current image looks like, apply a
//! [`PixelOp`], extract a rectangle, composite layers, and encode.
//!
//! The image value itself is an associated type. It carries its pixels plus
//! the output format and encoder options chosen so far, so `encode` needs no
//! extra arguments.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend), built on the `image`
//! crate. Tests use the recording `MockBackend` in [`tests`].

use super::params::{CompositeLayer, CropArea, LoadOptions, PixelOp};
use crate::types::ImageFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
    #[error("Format to {0} not supported")]
    UnsupportedFormat(ImageFormat),
}

/// What the current image looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// Format the image will be encoded as; the decoded format until changed.
    pub format: Option<ImageFormat>,
    /// Frame count. Greater than one only for animated sources loaded as such.
    pub pages: u32,
}

/// Trait for image processing backends.
///
/// Every backend implements the full set so the sequencer stays
/// backend-agnostic.
pub trait ImageBackend: Sync {
    type Image: Clone + Send;

    /// Decode source bytes.
    fn load(&self, bytes: &[u8], options: LoadOptions) -> Result<Self::Image, BackendError>;

    fn info(&self, image: &Self::Image) -> ImageInfo;

    fn apply(&self, image: &mut Self::Image, op: &PixelOp) -> Result<(), BackendError>;

    /// Cut `area` out of the image. Errors when the area does not fit.
    fn extract(&self, image: &mut Self::Image, area: &CropArea) -> Result<(), BackendError>;

    fn composite(
        &self,
        image: &mut Self::Image,
        layers: &[CompositeLayer],
    ) -> Result<(), BackendError>;

    /// Encode with the image's current output format and encoder options.
    fn encode(&self, image: &Self::Image) -> Result<Vec<u8>, BackendError>;
}
