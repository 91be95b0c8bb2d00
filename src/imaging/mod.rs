//! Image processing.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Decode** | `image`, `avif-parse` + `rav1d`, `resvg` |
//! | **Resize** | Lanczos3, cropped or padded per fit |
//! | **Composite** | overlays, alpha masks, round-crop ellipses |
//! | **Encode** | JPEG, PNG, WebP, TIFF, GIF, AVIF |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for geometry (unit testable)
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Operations**: The edit sequencer combining calculations + backend

pub mod backend;
pub mod calculations;
pub mod operations;
mod params;
pub mod rust_backend;

pub use backend::{BackendError, ImageBackend, ImageInfo};
pub use calculations::resolve_overlay_offset;
pub use operations::{Services, apply_edits};
pub use params::{
    BLUR_SIGMA_RANGE, Blend, BoundingBox, CompositeLayer, CropArea, Ellipse, EncoderOptions,
    Kernel, LayerInput, LoadOptions, PixelOp, ResizeOptions, Rgba, SHARPEN_SIGMA_RANGE,
};
pub use rust_backend::{RustBackend, RustImage};
