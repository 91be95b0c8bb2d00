//! Edit sequencing.
//!
//! [`apply_edits`] walks an [`EditMap`] in order and drives the backend.
//! Most operations become a single [`PixelOp`]; crop, overlay, smart crop,
//! round crop and content moderation combine geometry from
//! [`calculations`](super::calculations) with backend calls and the
//! collaborators in [`Services`].
//!
//! Two ordering rules apply on top of map order:
//!
//! - An overlay is placed against the resized image. When `overlayWith`
//!   comes before `resize`, the resize runs early and its own slot is skipped.
//! - Rotation, smart crop, round crop and content moderation are skipped on
//!   animated images.

use super::backend::ImageBackend;
use super::calculations::{
    alpha_tile_value, get_crop_area, handle_bounds, overlay_alpha, overlay_dimensions,
    plan_resize, resolve_overlay_offset, round_crop_ellipse,
};
use super::params::{
    BLUR_SIGMA_RANGE, BoundingBox, CompositeLayer, CropArea, EncoderOptions, LayerInput,
    LoadOptions, PixelOp, ResizeOptions, Rgba, SHARPEN_SIGMA_RANGE,
};
use crate::edits::{
    CropRegion, EditMap, EditOperation, ModerationOptions, Overlay, ResizeEdit, SmartCropOptions,
};
use crate::error::HandlerError;
use crate::services::{ImageRecognition, ObjectStore};
use crate::types::{Fit, ImageFormat};
use tracing::debug;

/// Result type for edit sequencing.
pub type Result<T> = std::result::Result<T, HandlerError>;

/// Default minimum confidence for moderation labels.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 75.0;
/// Default blur sigma for moderated content.
pub const DEFAULT_MODERATION_BLUR: f64 = 50.0;

/// Collaborators some edits need.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub store: &'a dyn ObjectStore,
    pub recognition: &'a dyn ImageRecognition,
}

/// Apply every edit in `edits` to `image`, in map order.
pub fn apply_edits<B: ImageBackend>(
    backend: &B,
    image: &mut B::Image,
    edits: &EditMap,
    services: Services<'_>,
) -> Result<()> {
    let animated = backend.info(image).pages > 1;
    let mut resized = false;

    for op in edits {
        if animated && skipped_when_animated(op) {
            debug!(edit = op.key(), "skipping edit on animated image");
            continue;
        }
        match op {
            EditOperation::Resize(resize) => {
                if !resized {
                    apply_resize(backend, image, resize)?;
                    resized = true;
                }
            }
            EditOperation::OverlayWith(overlay) => {
                if !resized && let Some(resize) = edits.resize() {
                    apply_resize(backend, image, resize)?;
                    resized = true;
                }
                apply_overlay(backend, image, overlay, services.store)?;
            }
            EditOperation::Crop(region) => apply_crop(backend, image, region.as_ref())?,
            EditOperation::SmartCrop(opts) => {
                apply_smart_crop(backend, image, opts, services.recognition)?
            }
            EditOperation::RoundCrop(request) => {
                let info = backend.info(image);
                let ellipse = round_crop_ellipse(request, info.width, info.height);
                backend.composite(
                    image,
                    &[CompositeLayer::mask(LayerInput::Ellipse(ellipse), false)],
                )?;
            }
            EditOperation::ContentModeration(opts) => {
                apply_moderation(backend, image, opts, services.recognition)?
            }
            other => {
                if let Some(pixel_op) = pixel_op(other) {
                    backend.apply(image, &pixel_op)?;
                }
            }
        }
    }
    Ok(())
}

fn skipped_when_animated(op: &EditOperation) -> bool {
    matches!(
        op,
        EditOperation::Rotate(_)
            | EditOperation::SmartCrop(_)
            | EditOperation::RoundCrop(_)
            | EditOperation::ContentModeration(_)
    )
}

/// The plain backend operation for an edit, if it has one.
fn pixel_op(op: &EditOperation) -> Option<PixelOp> {
    let pixel = match op {
        EditOperation::ToFormat(format) => PixelOp::ToFormat(*format, EncoderOptions::default()),
        EditOperation::Encoder(format, options) => PixelOp::ToFormat(*format, *options),
        EditOperation::Rotate(angle) => PixelOp::Rotate(*angle),
        EditOperation::Flip(true) => PixelOp::Flip,
        EditOperation::Flop(true) => PixelOp::Flop,
        EditOperation::Grayscale(true) => PixelOp::Grayscale,
        EditOperation::Normalize(true) => PixelOp::Normalize,
        EditOperation::Negate(true) => PixelOp::Negate,
        EditOperation::Blur(Some(sigma)) if !BLUR_SIGMA_RANGE.contains(sigma) => {
            debug!(sigma, "blur sigma out of range; skipping");
            return None;
        }
        EditOperation::Sharpen(Some(sigma)) if !SHARPEN_SIGMA_RANGE.contains(sigma) => {
            debug!(sigma, "sharpen sigma out of range; skipping");
            return None;
        }
        EditOperation::Blur(sigma) => PixelOp::Blur(*sigma),
        EditOperation::Sharpen(sigma) => PixelOp::Sharpen(*sigma),
        EditOperation::Tint(color) => PixelOp::Tint(*color),
        EditOperation::Flatten(background) => {
            PixelOp::Flatten(background.unwrap_or(Rgba::BLACK))
        }
        EditOperation::Convolve(kernel) => PixelOp::Convolve(kernel.clone()),
        EditOperation::PendingQuality(_) => {
            debug!("quality without a resolved format; ignoring");
            return None;
        }
        _ => return None,
    };
    Some(pixel)
}

/// Resolve a resize edit against the current image.
///
/// A bare ratio scales the current size and fits inside it.
pub fn resize_options(resize: &ResizeEdit, current: (u32, u32)) -> Option<ResizeOptions> {
    let side = |v: Option<f64>| v.filter(|v| v.is_finite() && *v > 0.0).map(|v| v.round() as u32);
    let (mut width, mut height) = (side(resize.width), side(resize.height));
    let mut fit = resize.fit.unwrap_or(Fit::Cover);

    if width.is_none()
        && height.is_none()
        && let Some(ratio) = resize.ratio.filter(|r| r.is_finite() && *r > 0.0)
    {
        width = Some((f64::from(current.0) * ratio).round() as u32);
        height = Some((f64::from(current.1) * ratio).round() as u32);
        fit = Fit::Inside;
    }
    if width.is_none() && height.is_none() {
        return None;
    }
    Some(ResizeOptions {
        width,
        height,
        fit,
        background: resize.background.unwrap_or(Rgba::BLACK),
        without_enlargement: resize.without_enlargement.unwrap_or(false),
    })
}

fn apply_resize<B: ImageBackend>(
    backend: &B,
    image: &mut B::Image,
    resize: &ResizeEdit,
) -> Result<()> {
    let info = backend.info(image);
    if let Some(options) = resize_options(resize, (info.width, info.height)) {
        let plan = plan_resize(
            (info.width, info.height),
            options.width,
            options.height,
            options.fit,
            options.without_enlargement,
        );
        if !plan.within_limits() {
            debug!(scaled = ?plan.scaled, output = ?plan.output(), "resize exceeds dimension limit");
            return Err(HandlerError::InvalidResize);
        }
        backend.apply(image, &PixelOp::Resize(options))?;
    }
    Ok(())
}

fn apply_crop<B: ImageBackend>(
    backend: &B,
    image: &mut B::Image,
    region: Option<&CropRegion>,
) -> Result<()> {
    let area = region
        .and_then(|r| {
            Some(CropArea {
                left: u32::try_from(r.left).ok()?,
                top: u32::try_from(r.top).ok()?,
                width: u32::try_from(r.width).ok()?,
                height: u32::try_from(r.height).ok()?,
            })
        })
        .ok_or(HandlerError::CropAreaOutOfBounds)?;
    backend
        .extract(image, &area)
        .map_err(|_| HandlerError::CropAreaOutOfBounds)
}

fn apply_overlay<B: ImageBackend>(
    backend: &B,
    image: &mut B::Image,
    overlay: &Overlay,
    store: &dyn ObjectStore,
) -> Result<()> {
    let info = backend.info(image);
    let object = store
        .get(&overlay.bucket, &overlay.key)
        .map_err(|e| e.into_handler_error(&overlay.key))?;
    let mut layer = backend.load(&object.body, LoadOptions::default())?;

    let (width, height) = overlay_dimensions(
        overlay.w_ratio.as_deref(),
        overlay.h_ratio.as_deref(),
        (info.width, info.height),
    );
    if width.is_some() || height.is_some() {
        backend.apply(
            &mut layer,
            &PixelOp::Resize(ResizeOptions {
                width,
                height,
                fit: Fit::Inside,
                ..ResizeOptions::default()
            }),
        )?;
    }

    let alpha = overlay_alpha(overlay.alpha.as_deref());
    let mask = Rgba {
        alpha: alpha_tile_value(alpha),
        ..Rgba::BLACK
    };
    backend.composite(&mut layer, &[CompositeLayer::mask(LayerInput::Solid(mask), true)])?;
    backend.apply(
        &mut layer,
        &PixelOp::ToFormat(ImageFormat::Png, EncoderOptions::default()),
    )?;

    let layer_info = backend.info(&layer);
    let left = resolve_overlay_offset(overlay.left.as_deref(), info.width, layer_info.width);
    let top = resolve_overlay_offset(overlay.top.as_deref(), info.height, layer_info.height);
    let encoded = backend.encode(&layer)?;
    backend.composite(
        image,
        &[CompositeLayer::over(LayerInput::Image(encoded), left, top)],
    )?;
    Ok(())
}

/// Encoded copy of the current image in a format recognition accepts.
fn recognition_snapshot<B: ImageBackend>(backend: &B, image: &B::Image) -> Result<Vec<u8>> {
    let mut snapshot = image.clone();
    let format = backend.info(&snapshot).format;
    if !matches!(format, Some(ImageFormat::Jpeg | ImageFormat::Png)) {
        backend.apply(
            &mut snapshot,
            &PixelOp::ToFormat(ImageFormat::Png, EncoderOptions::default()),
        )?;
    }
    Ok(backend.encode(&snapshot)?)
}

fn apply_smart_crop<B: ImageBackend>(
    backend: &B,
    image: &mut B::Image,
    opts: &SmartCropOptions,
    recognition: &dyn ImageRecognition,
) -> Result<()> {
    let snapshot = recognition_snapshot(backend, image)?;
    let faces = recognition.detect_faces(&snapshot)?;

    let bbox = if faces.is_empty() {
        BoundingBox::FULL
    } else {
        let index = opts.face_index.unwrap_or(0.0);
        let valid = index.is_finite() && index >= 0.0 && index.fract() == 0.0;
        let face = valid
            .then(|| faces.get(index as usize))
            .flatten()
            .ok_or(HandlerError::FaceIndexOutOfRange)?;
        face.bounding_box
    };

    let info = backend.info(image);
    let area = get_crop_area(
        handle_bounds(bbox),
        opts.padding.unwrap_or(0.0),
        (info.width, info.height),
    );
    debug!(?area, faces = faces.len(), "smart crop");
    backend
        .extract(image, &area)
        .map_err(|_| HandlerError::PaddingOutOfBounds)
}

fn apply_moderation<B: ImageBackend>(
    backend: &B,
    image: &mut B::Image,
    opts: &ModerationOptions,
    recognition: &dyn ImageRecognition,
) -> Result<()> {
    let snapshot = recognition_snapshot(backend, image)?;
    let min_confidence = opts.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE);
    let labels = recognition.detect_moderation_labels(&snapshot, min_confidence)?;

    let flagged = match &opts.moderation_labels {
        Some(wanted) => labels.iter().any(|label| wanted.contains(&label.name)),
        None => !labels.is_empty(),
    };
    let blur = opts.blur.map(f64::ceil).unwrap_or(DEFAULT_MODERATION_BLUR);
    if flagged && BLUR_SIGMA_RANGE.contains(&blur) {
        backend.apply(image, &PixelOp::Blur(Some(blur)))?;
    }
    Ok(())
}
