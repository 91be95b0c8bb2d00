//! Output assembly.
//!
//! Renders a resolved [`ImageRequestContext`] into the response body:
//!
//! | Request | Work done |
//! |---|---|
//! | Edits with an effect | decode → [`apply_edits`] → output format → encode |
//! | Only an output format | decode → output format → encode |
//! | Neither | original bytes |
//!
//! The body is base64-encoded and must stay under [`PAYLOAD_LIMIT`].

use crate::edits::{EditMap, EditOperation};
use crate::error::HandlerError;
use crate::imaging::{EncoderOptions, ImageBackend, LoadOptions, PixelOp, Services, apply_edits};
use crate::request::ImageRequestContext;
use crate::types::{ImageFormat, infer_content_type};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

/// Largest base64 body a response may carry.
pub const PAYLOAD_LIMIT: usize = 6 * 1024 * 1024;

/// Render and base64-encode the response body.
pub fn process<B: ImageBackend>(
    backend: &B,
    ctx: &ImageRequestContext,
    services: Services<'_>,
) -> Result<String, HandlerError> {
    let bytes = render_bytes(backend, ctx, services)?;
    let body = STANDARD.encode(&bytes);
    if body.len() > PAYLOAD_LIMIT {
        warn!(key = %ctx.key, size = body.len(), "rendered image exceeds payload limit");
        return Err(HandlerError::TooLargeImage);
    }
    Ok(body)
}

/// Render the raw response bytes.
pub fn render_bytes<B: ImageBackend>(
    backend: &B,
    ctx: &ImageRequestContext,
    services: Services<'_>,
) -> Result<Vec<u8>, HandlerError> {
    if ctx.edits.has_effect() {
        let options = LoadOptions {
            animated: wants_animation(&ctx.edits, &ctx.original_image),
        };
        let mut image = backend.load(&ctx.original_image, options)?;
        apply_edits(backend, &mut image, &ctx.edits, services)?;
        if let Some(format) = ctx.output_format {
            backend.apply(&mut image, &output_op(format, ctx.effort))?;
        }
        Ok(backend.encode(&image)?)
    } else if let Some(format) = ctx.output_format {
        let mut image = backend.load(&ctx.original_image, LoadOptions::default())?;
        backend.apply(&mut image, &output_op(format, ctx.effort))?;
        Ok(backend.encode(&image)?)
    } else {
        debug!(key = %ctx.key, "serving original bytes");
        Ok(ctx.original_image.clone())
    }
}

/// An explicit `animated` edit wins; otherwise GIF sources animate.
fn wants_animation(edits: &EditMap, source: &[u8]) -> bool {
    match edits.get(crate::edits::ANIMATED) {
        Some(EditOperation::Animated(flag)) => *flag,
        _ => infer_content_type(source) == ImageFormat::Gif.content_type(),
    }
}

fn output_op(format: ImageFormat, effort: Option<u8>) -> PixelOp {
    let options = match (format, effort) {
        (ImageFormat::Webp, Some(effort)) => EncoderOptions {
            effort: Some(effort),
            ..EncoderOptions::default()
        },
        _ => EncoderOptions::default(),
    };
    PixelOp::ToFormat(format, options)
}
